//! Calibration file persistence.

use std::path::{Path, PathBuf};

use chrono::Utc;
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;
use crate::solver::calibrate::CalibrationOutcome;
use crate::solver::CameraIntrinsics;

/// On-disk calibration record. Matrix rows are kept as nested arrays so the
/// file stays readable by hand.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    pub date: String,
    pub camera_matrix: Vec<Vec<f64>>,
    pub distortion_coefficients: Vec<f64>,
}

impl CalibrationData {
    pub fn from_outcome(outcome: &CalibrationOutcome) -> Self {
        let m = &outcome.camera_matrix;
        Self {
            date: Utc::now().to_rfc3339(),
            camera_matrix: (0..3)
                .map(|r| (0..3).map(|c| m[(r, c)]).collect())
                .collect(),
            distortion_coefficients: outcome.distortion.clone(),
        }
    }

    /// An empty record means the camera has never been calibrated. That is
    /// a normal startup state, not an error.
    pub fn is_present(&self) -> bool {
        !self.camera_matrix.is_empty() && !self.distortion_coefficients.is_empty()
    }

    /// Intrinsics for the solver, or `None` when the record is empty or
    /// malformed.
    pub fn intrinsics(&self) -> Option<CameraIntrinsics> {
        if !self.is_present() {
            return None;
        }
        let m = &self.camera_matrix;
        if m.len() != 3 || m.iter().any(|row| row.len() != 3) {
            return None;
        }
        let matrix = Matrix3::new(
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        );
        CameraIntrinsics::new(matrix, self.distortion_coefficients.clone()).ok()
    }
}

/// Reads and writes the calibration file.
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored calibration. An absent or unreadable file yields the
    /// empty record; startup must not fail over a missing calibration.
    pub async fn load(&self) -> CalibrationData {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no calibration file, camera is uncalibrated");
            return CalibrationData::default();
        }
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unable to read calibration file");
                return CalibrationData::default();
            }
        };
        match serde_json::from_str::<CalibrationData>(&raw) {
            Ok(data) => {
                info!(path = %self.path.display(), date = %data.date, "loaded calibration");
                data
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "calibration file is corrupt, ignoring it");
                CalibrationData::default()
            }
        }
    }

    pub async fn save(&self, data: &CalibrationData) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, json).await?;
        info!(path = %self.path.display(), "saved calibration");
        Ok(())
    }

    /// Removes the stored file if it exists. A stale calibration must not
    /// survive into a new solve attempt.
    pub async fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_data() -> CalibrationData {
        CalibrationData {
            date: "2026-02-11T09:30:00+00:00".to_string(),
            camera_matrix: vec![
                vec![900.0, 0.0, 640.0],
                vec![0.0, 905.0, 360.0],
                vec![0.0, 0.0, 1.0],
            ],
            distortion_coefficients: vec![0.02, -0.11, 0.0, 0.0, 0.0],
        }
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration.json"));

        store.save(&sample_data()).await.unwrap();
        let loaded = store.load().await;

        assert!(loaded.is_present());
        assert_eq!(loaded.date, "2026-02-11T09:30:00+00:00");
        assert_eq!(loaded.camera_matrix[0][0], 900.0);
        assert_eq!(loaded.distortion_coefficients.len(), 5);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration.json"));

        let loaded = store.load().await;
        assert!(!loaded.is_present());
        assert!(loaded.intrinsics().is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = CalibrationStore::new(path);
        assert!(!store.load().await.is_present());
    }

    #[tokio::test]
    async fn test_remove_clears_stored_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let store = CalibrationStore::new(&path);

        store.save(&sample_data()).await.unwrap();
        assert!(path.exists());
        store.remove().await.unwrap();
        assert!(!path.exists());
        // Removing an absent file stays quiet.
        store.remove().await.unwrap();
    }

    #[test]
    fn test_intrinsics_from_record() {
        let intrinsics = sample_data().intrinsics().unwrap();
        assert_relative_eq!(intrinsics.matrix()[(0, 0)], 900.0);
        assert_relative_eq!(intrinsics.matrix()[(1, 2)], 360.0);
        assert_eq!(intrinsics.distortion().len(), 5);
    }

    #[test]
    fn test_malformed_matrix_yields_no_intrinsics() {
        let mut data = sample_data();
        data.camera_matrix = vec![vec![1.0, 2.0]];
        assert!(data.intrinsics().is_none());
    }
}

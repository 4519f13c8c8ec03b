//! Cooperative pause/stop control via sentinel files in the state
//! directory.
//!
//! `PAUSE` holds the run at the next checkpoint until the file is deleted;
//! `STOP` ends the run gracefully at the next checkpoint. In-flight agent
//! work is never killed.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::info;

pub const PAUSE_FILE: &str = "PAUSE";
pub const STOP_FILE: &str = "STOP";

/// Checkpoint verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDecision {
    Proceed,
    Stop,
}

#[derive(Debug, Clone)]
pub struct ControlFiles {
    pause_path: PathBuf,
    stop_path: PathBuf,
    poll: Duration,
}

impl ControlFiles {
    pub fn new(state_dir: &Path, poll: Duration) -> Self {
        Self {
            pause_path: state_dir.join(PAUSE_FILE),
            stop_path: state_dir.join(STOP_FILE),
            poll,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path.exists()
    }

    /// Block while the pause marker exists.
    pub fn wait_if_paused(&self) {
        let mut announced = false;
        while self.pause_path.exists() {
            if !announced {
                info!(
                    marker = %self.pause_path.display(),
                    "paused, delete the marker to continue"
                );
                announced = true;
            }
            thread::sleep(self.poll);
        }
        if announced {
            info!("pause marker removed, continuing");
        }
    }

    /// One checkpoint: honor a pause first, then test for stop. Pausing
    /// before the stop test lets an operator place `STOP` while paused.
    pub fn checkpoint(&self) -> ControlDecision {
        self.wait_if_paused();
        if self.stop_requested() {
            info!(marker = %self.stop_path.display(), "stop requested");
            ControlDecision::Stop
        } else {
            ControlDecision::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    #[test]
    fn proceeds_when_no_markers_exist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let controls = ControlFiles::new(temp.path(), Duration::from_millis(10));
        assert_eq!(controls.checkpoint(), ControlDecision::Proceed);
    }

    #[test]
    fn stop_marker_ends_the_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(STOP_FILE), "").expect("write stop");
        let controls = ControlFiles::new(temp.path(), Duration::from_millis(10));
        assert_eq!(controls.checkpoint(), ControlDecision::Stop);
    }

    #[test]
    fn pause_blocks_until_marker_is_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pause = temp.path().join(PAUSE_FILE);
        fs::write(&pause, "").expect("write pause");
        let controls = ControlFiles::new(temp.path(), Duration::from_millis(20));

        let dir = temp.path().to_path_buf();
        let remover = thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            fs::remove_file(dir.join(PAUSE_FILE)).expect("remove pause");
        });

        let started = Instant::now();
        let decision = controls.checkpoint();
        remover.join().expect("join remover");
        assert_eq!(decision, ControlDecision::Proceed);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}

use std::sync::Arc;

use super::cell::{CellTable, FrameCell};
use crate::frame::AnnotatedFrame;

/// Snapshot distribution: the latest annotated frame per camera, on demand.
///
/// `read` never blocks on the producer and never waits for a new frame.
/// Cloning the sink is cheap and shares the same cells.
#[derive(Clone, Default)]
pub struct PullSink {
    cells: Arc<CellTable>,
}

impl PullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest frame for `camera_id`, or `None` if nothing has been written
    /// (or the camera is not registered).
    pub fn read(&self, camera_id: &str) -> Option<Arc<AnnotatedFrame>> {
        self.cells.get(camera_id).and_then(|cell| cell.load())
    }

    /// Cameras that currently have a cell.
    pub fn cameras(&self) -> Vec<String> {
        self.cells.ids()
    }

    pub(crate) fn register(&self, camera_id: &str) -> Arc<FrameCell> {
        self.cells.register(camera_id)
    }

    pub(crate) fn unregister(&self, camera_id: &str, cell: &Arc<FrameCell>) -> bool {
        self.cells.unregister(camera_id, cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_frame;
    use std::thread;

    #[test]
    fn absent_until_written() {
        let sink = PullSink::new();
        assert!(sink.read("cam").is_none());

        let cell = sink.register("cam");
        assert!(sink.read("cam").is_none());

        cell.store(test_frame("cam", 0));
        assert_eq!(sink.read("cam").map(|f| f.sequence()), Some(0));
        assert_eq!(sink.cameras(), vec!["cam".to_string()]);
    }

    #[test]
    fn concurrent_readers_see_non_decreasing_sequences() {
        let sink = PullSink::new();
        let cell = sink.register("cam");

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let sink = sink.clone();
                thread::spawn(move || {
                    let mut last = None;
                    for _ in 0..2_000 {
                        if let Some(frame) = sink.read("cam") {
                            let seq = frame.sequence();
                            assert!(last.map_or(true, |prev| seq >= prev));
                            assert_eq!(frame.pixels(), &[seq as u8; 6][..]);
                            last = Some(seq);
                        }
                    }
                })
            })
            .collect();

        for seq in 0..200 {
            cell.store(test_frame("cam", seq));
        }
        for reader in readers {
            reader.join().expect("reader thread");
        }
    }

    #[test]
    fn unregistered_camera_reads_absent() {
        let sink = PullSink::new();
        let cell = sink.register("cam");
        cell.store(test_frame("cam", 3));
        assert!(sink.unregister("cam", &cell));
        assert!(sink.read("cam").is_none());
    }
}

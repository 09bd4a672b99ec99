pub mod motion;
pub mod passthrough;

pub use motion::MotionAnnotator;
pub use passthrough::PassthroughAnnotator;

// src/drivers/mod.rs
// Device transports, the live window and figure rendering.
pub mod brainflow;
pub mod buffer;
pub mod plot;
pub mod simulator;
pub mod source;

pub use brainflow::BrainFlowTransport;
pub use buffer::{BufferReader, StreamingBuffer, StreamingWindow};
pub use plot::{render_figure_png, save_figure_png, PlotStyle};
pub use simulator::SimulatedTransport;
pub use source::{DeviceTransport, ManualTransport};

pub mod flow;
pub mod terminal;

pub use terminal::{ReviewChoice, TerminalObserver};

//! Terminal output processing
//!
//! Raw PTY bytes → [`LineAssembler`] → [`sanitize`] → [`RedrawFilter`] →
//! [`segment`] → chat messages.

mod assembler;
pub mod chrome;
mod redraw;
mod sanitizer;
mod segmenter;

pub use assembler::LineAssembler;
pub use chrome::{classify as classify_chrome, ChromeReason, CHROME_TABLE_VERSION};
pub use redraw::RedrawFilter;
pub use sanitizer::{sanitize, sanitize_text};
pub use segmenter::segment;

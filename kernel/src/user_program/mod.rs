//! Building the initial address space of a user program.

pub mod executable;
pub mod loader;

pub use self::executable::{Executable, MemoryFile};
pub use self::loader::{load_image, load_segment, setup_stack, LoadError, Segment, SegmentError};

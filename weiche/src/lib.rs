mod error;
mod fiber;
mod heap;
mod interning;
mod message;
mod method_table;
mod native;
mod object;
mod system;
mod tagged;

pub use error::*;
pub use fiber::{ExecutionPoint, Fiber, FiberState};
pub use heap::*;
pub use interning::*;
pub use message::*;
pub use method_table::*;
pub use native::*;
pub use object::*;
pub use system::{PAGE_SIZE, map_memory, unmap_memory};
pub use tagged::*;

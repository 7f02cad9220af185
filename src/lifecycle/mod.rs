//! Node lifecycle: the pure state machine and the lifecycler driving it.

mod lifecycler;
mod state;

pub use lifecycler::{FlushTransferer, Lifecycler};
pub use state::{transition, LifecycleEvent};

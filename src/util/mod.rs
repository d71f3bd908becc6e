pub mod retry;
pub(crate) mod runnable;

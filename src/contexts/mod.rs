pub(crate) mod attribute_reference;
pub(crate) mod context;
pub(crate) mod context_builder;

pub use attribute_reference::Reference;
pub use context::{Context, Kind};
pub use context_builder::{ContextBuilder, MultiContextBuilder};

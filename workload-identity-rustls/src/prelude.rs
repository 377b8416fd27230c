//! Internal prelude.

#[allow(unused_imports)]
pub(crate) use crate::observability::{debug, error, info, warn};

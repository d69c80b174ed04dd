/*!
Platform access for sundial: a blocking REST implementation of the
[`sundial_core::Platform`] capability trait, plus the polling informer that
turns the platform's group listing into the event stream the controller
consumes.

Everything here is plumbing; behavior lives in `sundial_core`.
*/

pub(crate) mod informer;
pub(crate) mod rest;

// sundial_client Public API
pub use crate::{
    informer::{GroupInformer, InformerOptions},
    rest::{RestOptions, RestPlatform},
};

pub mod arena;

use std::fmt::Display;

/// Report a programming-contract violation.
///
/// Debug builds panic with the message. Release builds log it and hand the
/// error back so the caller can return it without touching any other entity.
#[track_caller]
pub fn contract_violation<E: Display>(err: E) -> E {
    if cfg!(debug_assertions) {
        panic!("contract violation: {}", err);
    }
    tracing::error!(error = %err, "contract violation");
    err
}

use itertools::Itertools;

use crate::type_info::TypeId;

/// An unrecoverable injection error.
///
/// By the time the runtime engine executes, the compile-time front-end has
/// already ruled out every error a caller could meaningfully react to.
/// Anything left is a latent defect in the component declarations, so the
/// public entry points render the diagnostic and panic rather than returning
/// it. The `try_*` variants surface the underlying `Result` for the
/// front-end's own test harnesses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FatalError {
    #[error(
        "the type `{0}` was provided more than once, with different bindings. \
        At least one of the involved components bound this type without exposing it, \
        which is why this was not caught when the components were checked"
    )]
    InconsistentBindings(TypeId),
    #[error(
        "the component function at {component:#x} transitively installs itself, \
        directly or through a chain of replacements"
    )]
    InstallationLoop { component: usize },
    #[error("the dependency graph contains a cycle: {}", cycle.iter().map(|id| format!("`{id}`")).join(" -> "))]
    DependencyCycle { cycle: Vec<TypeId> },
    #[error("the type `{0}` depends on itself")]
    SelfLoop(TypeId),
    #[error(
        "cannot construct an injector: no binding was provided for {}",
        missing.iter().map(|id| format!("`{id}`")).join(", ")
    )]
    UnsatisfiedRequirements { missing: Vec<TypeId> },
    #[error(
        "the component function at {component:#x} was replaced after it had already been installed; \
        replacements must be declared before the component they replace"
    )]
    ReplacementAfterInstall { component: usize },
    #[error(
        "the component function at {component:#x} was replaced with two different component functions"
    )]
    InconsistentReplacement { component: usize },
    #[error("the provider for the type `{0}` returned a null pointer")]
    NullProvider(TypeId),
    #[error("no binding was provided for the type `{0}`")]
    UnboundType(TypeId),
}

/// Render `error` and terminate.
///
/// No partially-normalized state is ever observable past this point.
pub(crate) fn fatal(error: FatalError) -> ! {
    tracing::error!(error = %error, "fatal injection error");
    panic!("fatal injection error: {error}");
}

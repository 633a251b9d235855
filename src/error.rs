use ash::vk;

/// Top-level error type returned across the public API boundary.
///
/// Internally most plumbing still uses `anyhow::Result` (see the teacher's
/// convention throughout `device`/`resource`/`transfer`), but callers outside
/// this crate need to be able to match on the taxonomy from the design
/// notes: fatal initialisation failures must not be confused with the
/// transient, internally-recovered surface states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no Vulkan loader found: {0}")]
    LoaderMissing(#[source] ash::LoadingError),

    #[error("no physical device satisfies the required extension set")]
    NoSuitablePhysicalDevice,

    #[error("surface creation failed: {0}")]
    SurfaceCreation(#[source] vk::Result),

    #[error("required device extension missing: {0}")]
    RequiredExtensionMissing(String),

    #[error("vulkan call failed: {0}")]
    Vulkan(#[source] vk::Result),

    #[error("resource construction failed: {0}")]
    ResourceCreation(String),

    #[error("usage error: {0}")]
    Usage(String),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        Error::Vulkan(result)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

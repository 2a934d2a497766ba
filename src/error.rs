pub type Error = RekeyError;
pub type Result<T> = std::result::Result<T, Error>;

/// A macro to simplify the creation of `RekeyError` variants.
/// It automatically injects source code metadata (file and line) into every error.
#[macro_export]
macro_rules! rekey_error {
    // Variants with named fields, e.g. rekey_error!(Variant { field: value }).
    // Field init shorthand works too, e.g. rekey_error!(NotFound { raid_group }).
    ($variant:ident { $($field:ident $(: $value:expr)?),* $(,)? }) => {{
        $crate::RekeyError::$variant {
            $($field $(: $value)?,)*
            meta: $crate::ErrorMeta::new($crate::ErrorLocation::new(file!(), line!())),
        }
    }};
    // Variants without additional fields, e.g. rekey_error!(Shutdown).
    ($variant:ident) => {{
        $crate::RekeyError::$variant {
            meta: $crate::ErrorMeta::new($crate::ErrorLocation::new(file!(), line!())),
        }
    }};
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorLocation {
    file: &'static str,
    line: u32,
}

impl ErrorLocation {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }
}

impl Default for ErrorLocation {
    fn default() -> Self {
        Self {
            file: "<unknown>",
            line: 0,
        }
    }
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMeta {
    pub location: ErrorLocation,
    pub contexts: Vec<(String, ErrorLocation)>,
}

impl ErrorMeta {
    pub fn new(location: ErrorLocation) -> Self {
        Self {
            location,
            contexts: Vec::new(),
        }
    }
}

impl Default for ErrorMeta {
    #[track_caller]
    fn default() -> Self {
        let location = std::panic::Location::caller();
        Self::new(ErrorLocation::new(location.file(), location.line()))
    }
}

impl std::fmt::Display for ErrorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            return write!(f, "(at {})", self.location);
        }
        if self.contexts.is_empty() {
            return Ok(());
        }
        let mut iter = self.contexts.iter().rev();
        if let Some(context) = iter.next() {
            write!(f, "{} (at {})", context.0, context.1)?;
        }
        for context in iter {
            write!(f, "\n  - caused by: {} (at {})", context.0, context.1)?;
        }
        write!(f, "\n  - caused by: ")?;
        Ok(())
    }
}

/// Generates the central RekeyError enum.
macro_rules! rekey_error_variants {
    ($( $variant:ident { $( $(#[$field_attr:meta])* $field:ident : $ty:ty ),* $(,)? } => $message:expr ),* $(,)?) => {
        #[derive(thiserror::Error, Debug)]
        pub enum RekeyError {
            $(
                #[error($message)]
                $variant {
                    $( $(#[$field_attr])* $field: $ty, )*
                },
            )*
        }

        impl RekeyError {
            fn meta_mut(&mut self) -> &mut ErrorMeta {
                match self {
                    $( RekeyError::$variant { meta, .. } => meta, )*
                }
            }

            pub fn meta(&self) -> &ErrorMeta {
                match self {
                    $( RekeyError::$variant { meta, .. } => meta, )*
                }
            }
        }
    };
}

rekey_error_variants! {
    ThreadCreation {
        #[source]
        source: std::io::Error,
        meta: ErrorMeta,
    } => "{meta}Thread creation error: {source} {meta:#}",
    IoError {
        #[source]
        source: std::io::Error,
        meta: ErrorMeta,
    } => "{meta}I/O error: {source} {meta:#}",
    ChannelError {
        reason: String,
        meta: ErrorMeta,
    } => "{meta}Channel error: {reason} {meta:#}",
    InvalidParameter {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Invalid parameter error: {description} {meta:#}",
    MetadataError {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Metadata error: {description} {meta:#}",
    CryptoError {
        description: String,
        meta: ErrorMeta,
    } => "{meta}Cryptography error: {description} {meta:#}",
    PositionFailed {
        position: usize,
        description: String,
        meta: ErrorMeta,
    } => "{meta}Position {position} failed: {description} {meta:#}",
    PagedIoError {
        block: u64,
        description: String,
        meta: ErrorMeta,
    } => "{meta}Paged metadata block {block} I/O error: {description} {meta:#}",
    CheckpointRegression {
        current: u64,
        requested: u64,
        meta: ErrorMeta,
    } => "{meta}Checkpoint regression: requested {requested} is below current {current} {meta:#}",
    UnresolvableChunk {
        chunk: u64,
        reason: String,
        meta: ErrorMeta,
    } => "{meta}Chunk {chunk} rekey state is unresolvable: {reason} {meta:#}",
    QuiesceTimeout {
        waited_ms: u64,
        inflight: usize,
        meta: ErrorMeta,
    } => "{meta}Quiesce did not drain after {waited_ms} ms with {inflight} requests in flight {meta:#}",
    PeerAckTimeout {
        sequence: u64,
        meta: ErrorMeta,
    } => "{meta}Peer did not acknowledge checkpoint hint {sequence} {meta:#}",
    RedundancyExceeded {
        degraded: usize,
        tolerance: usize,
        meta: ErrorMeta,
    } => "{meta}Redundancy exceeded: {degraded} degraded positions, raid type tolerates {tolerance} {meta:#}",
    DataInvalidated {
        chunk: u64,
        meta: ErrorMeta,
    } => "{meta}Chunk {chunk} holds invalidated data {meta:#}",
    RebuildTimeout {
        position: usize,
        meta: ErrorMeta,
    } => "{meta}Rebuild of position {position} did not finish in time {meta:#}",
    NotFound {
        raid_group: u32,
        meta: ErrorMeta,
    } => "{meta}Raid group {raid_group} not found {meta:#}",
}

/// Automatically implements From<ExternalError> for RekeyError.
macro_rules! rekey_error_from {
    ($( #[from] $variant:ident ( $field:ident : $ty:ty ) ),* $(,)?) => {
        $(
            impl From<$ty> for RekeyError {
                #[track_caller]
                fn from($field: $ty) -> Self {
                    let location = std::panic::Location::caller();
                    RekeyError::$variant {
                        $field,
                        meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
                    }
                }
            }
        )*
    };
}

rekey_error_from! {
    #[from] IoError(source: std::io::Error),
}

impl<T> From<std::sync::mpsc::SendError<T>> for RekeyError {
    #[track_caller]
    fn from(source: std::sync::mpsc::SendError<T>) -> Self {
        let location = std::panic::Location::caller();
        RekeyError::ChannelError {
            reason: source.to_string(),
            meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
        }
    }
}

impl From<std::sync::mpsc::RecvTimeoutError> for RekeyError {
    #[track_caller]
    fn from(source: std::sync::mpsc::RecvTimeoutError) -> Self {
        let location = std::panic::Location::caller();
        RekeyError::ChannelError {
            reason: source.to_string(),
            meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
        }
    }
}

impl From<bincode::Error> for RekeyError {
    #[track_caller]
    fn from(source: bincode::Error) -> Self {
        let location = std::panic::Location::caller();
        RekeyError::MetadataError {
            description: source.to_string(),
            meta: ErrorMeta::new(ErrorLocation::new(location.file(), location.line())),
        }
    }
}

impl RekeyError {
    #[track_caller]
    pub fn context(self, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        self.context_at(message, location)
    }

    pub fn context_at(
        mut self,
        message: impl Into<String>,
        location: &'static std::panic::Location<'static>,
    ) -> Self {
        self.meta_mut().contexts.push((
            message.into(),
            ErrorLocation::new(location.file(), location.line()),
        ));
        self
    }

    /// Errors after which the raid group must not keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RekeyError::CheckpointRegression { .. }
                | RekeyError::UnresolvableChunk { .. }
                | RekeyError::QuiesceTimeout { .. }
                | RekeyError::RedundancyExceeded { .. }
                | RekeyError::RebuildTimeout { .. }
        )
    }
}

/// Extension trait to add context to Results.
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<RekeyError>,
{
    #[track_caller]
    fn context(self, message: impl Into<String>) -> Result<T> {
        let location = std::panic::Location::caller();
        self.map_err(|e| e.into().context_at(message, location))
    }
}

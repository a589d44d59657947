use core::fmt;

/// Closed result enum for the filesystem and its storage.
///
/// Benign outcomes (`NameExists`, `NameNotInDir`, ...) are ordinary return
/// codes; storage and structure errors additionally put the filesystem
/// instance into its error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfsError {
    // storage errors
    /// Storage cannot grow past its configured maximum block count
    OutOfSpace,
    /// Block index past the current end of the store
    BlockIndexInvalid,
    /// The storage is in a (possibly recoverable) error state
    StorageInErrorState,

    // structure errors
    /// A block did not carry the expected on-disk kind or layout
    UnexpectedBlockKind,
    /// Version magic mismatch, or block size below the supported minimum
    UnsupportedFsVersion,

    // object errors
    /// The object id can never have referred to a live object
    InvalidObjId,
    /// The directory existed before but does not any more
    DirNotFound,
    /// The object existed before but does not any more
    ObjNotFound,
    /// A directory was expected but the id refers to a file
    ObjNotDir,
    /// A file was expected but the id refers to a directory
    ObjNotFile,

    // name errors
    NameTooLong,
    NameInvalid,
    /// The name is not present in the directory
    NameNotInDir,
    /// The name is already present in the directory
    NameExists,
    InvalidPathSyntax,

    // tree state errors
    MetaDataTooLong,
    /// Metadata can be rewritten but its length is fixed at creation
    MetaDataCannotChangeLen,
    /// The move would make a directory its own ancestor
    MoveDestInvalid,
    DirNotEmpty,
    FileNotEmpty,
    /// Read offset past end of file
    InvalidOffset,
}

impl fmt::Display for AfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Convenience Result type alias.
pub type Result<T> = ::core::result::Result<T, AfsError>;

//! Server and client result codes
//!
//! Positive values (and zero) come straight off the wire in byte 13 of the
//! message header. Negative values are produced client-side only.

use std::fmt;

/// Result code of a command, server-side or client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    // Client-side codes
    GrpcError,
    NetworkError,
    CommonError,
    MaxRetriesExceeded,
    MaxErrorRate,
    RackNotDefined,
    InvalidClusterPartitionMap,
    ServerNotAvailable,
    ClusterNameMismatch,
    RecordsetClosed,
    NoAvailableConnectionsToNode,
    TypeNotSupported,
    CommandRejected,
    QueryTerminated,
    ScanTerminated,
    InvalidNodeError,
    ParseError,
    SerializeError,

    // Server codes
    Ok,
    ServerError,
    KeyNotFoundError,
    GenerationError,
    ParameterError,
    KeyExistsError,
    BinExistsError,
    ClusterKeyMismatch,
    ServerMemError,
    Timeout,
    AlwaysForbidden,
    PartitionUnavailable,
    BinTypeError,
    RecordTooBig,
    KeyBusy,
    ScanAbort,
    UnsupportedFeature,
    BinNotFound,
    DeviceOverload,
    KeyMismatch,
    InvalidNamespace,
    BinNameTooLong,
    FailForbidden,
    ElementNotFound,
    ElementExists,
    EnterpriseOnly,
    OpNotApplicable,
    FilteredOut,
    LostConflict,
    QueryEnd,
    SecurityNotSupported,
    SecurityNotEnabled,
    SecuritySchemeNotSupported,
    InvalidCommand,
    InvalidField,
    IllegalState,
    InvalidUser,
    UserAlreadyExists,
    InvalidPassword,
    ExpiredPassword,
    ForbiddenPassword,
    InvalidCredential,
    ExpiredSession,
    InvalidRole,
    RoleAlreadyExists,
    InvalidPrivilege,
    InvalidWhitelist,
    QuotasNotEnabled,
    InvalidQuota,
    NotAuthenticated,
    RoleViolation,
    NotWhitelisted,
    QuotaExceeded,
    UdfBadResponse,
    BatchDisabled,
    BatchMaxRequestsExceeded,
    BatchQueuesFull,
    GeoInvalidGeojson,
    IndexFound,
    IndexNotFound,
    IndexOom,
    IndexNotReadable,
    IndexGeneric,
    IndexNameMaxLen,
    IndexMaxCount,
    QueryAborted,
    QueryQueueFull,
    QueryTimeout,
    QueryGeneric,
    QueryNetioErr,
    QueryDuplicate,
    AerospikeErrUdfNotFound,
    AerospikeErrLuaFileNotFound,

    /// A code this client does not know by name.
    Unknown(i32),
}

impl ResultCode {
    /// Map a raw code onto a `ResultCode`.
    pub fn from_code(code: i32) -> ResultCode {
        use ResultCode::*;
        match code {
            -21 => GrpcError,
            -18 => NetworkError,
            -17 => CommonError,
            -16 => MaxRetriesExceeded,
            -15 => MaxErrorRate,
            -13 => RackNotDefined,
            -12 => InvalidClusterPartitionMap,
            -11 => ServerNotAvailable,
            -10 => ClusterNameMismatch,
            -9 => RecordsetClosed,
            -8 => NoAvailableConnectionsToNode,
            -7 => TypeNotSupported,
            -6 => CommandRejected,
            -5 => QueryTerminated,
            -4 => ScanTerminated,
            -3 => InvalidNodeError,
            -2 => ParseError,
            -1 => SerializeError,
            0 => Ok,
            1 => ServerError,
            2 => KeyNotFoundError,
            3 => GenerationError,
            4 => ParameterError,
            5 => KeyExistsError,
            6 => BinExistsError,
            7 => ClusterKeyMismatch,
            8 => ServerMemError,
            9 => Timeout,
            10 => AlwaysForbidden,
            11 => PartitionUnavailable,
            12 => BinTypeError,
            13 => RecordTooBig,
            14 => KeyBusy,
            15 => ScanAbort,
            16 => UnsupportedFeature,
            17 => BinNotFound,
            18 => DeviceOverload,
            19 => KeyMismatch,
            20 => InvalidNamespace,
            21 => BinNameTooLong,
            22 => FailForbidden,
            23 => ElementNotFound,
            24 => ElementExists,
            25 => EnterpriseOnly,
            26 => OpNotApplicable,
            27 => FilteredOut,
            28 => LostConflict,
            50 => QueryEnd,
            51 => SecurityNotSupported,
            52 => SecurityNotEnabled,
            53 => SecuritySchemeNotSupported,
            54 => InvalidCommand,
            55 => InvalidField,
            56 => IllegalState,
            60 => InvalidUser,
            61 => UserAlreadyExists,
            62 => InvalidPassword,
            63 => ExpiredPassword,
            64 => ForbiddenPassword,
            65 => InvalidCredential,
            66 => ExpiredSession,
            70 => InvalidRole,
            71 => RoleAlreadyExists,
            72 => InvalidPrivilege,
            73 => InvalidWhitelist,
            74 => QuotasNotEnabled,
            75 => InvalidQuota,
            80 => NotAuthenticated,
            81 => RoleViolation,
            82 => NotWhitelisted,
            83 => QuotaExceeded,
            100 => UdfBadResponse,
            150 => BatchDisabled,
            151 => BatchMaxRequestsExceeded,
            152 => BatchQueuesFull,
            160 => GeoInvalidGeojson,
            200 => IndexFound,
            201 => IndexNotFound,
            202 => IndexOom,
            203 => IndexNotReadable,
            204 => IndexGeneric,
            205 => IndexNameMaxLen,
            206 => IndexMaxCount,
            210 => QueryAborted,
            211 => QueryQueueFull,
            212 => QueryTimeout,
            213 => QueryGeneric,
            214 => QueryNetioErr,
            215 => QueryDuplicate,
            1301 => AerospikeErrUdfNotFound,
            1302 => AerospikeErrLuaFileNotFound,
            other => Unknown(other),
        }
    }

    /// Raw numeric value of this code.
    pub fn code(&self) -> i32 {
        use ResultCode::*;
        match *self {
            GrpcError => -21,
            NetworkError => -18,
            CommonError => -17,
            MaxRetriesExceeded => -16,
            MaxErrorRate => -15,
            RackNotDefined => -13,
            InvalidClusterPartitionMap => -12,
            ServerNotAvailable => -11,
            ClusterNameMismatch => -10,
            RecordsetClosed => -9,
            NoAvailableConnectionsToNode => -8,
            TypeNotSupported => -7,
            CommandRejected => -6,
            QueryTerminated => -5,
            ScanTerminated => -4,
            InvalidNodeError => -3,
            ParseError => -2,
            SerializeError => -1,
            Ok => 0,
            ServerError => 1,
            KeyNotFoundError => 2,
            GenerationError => 3,
            ParameterError => 4,
            KeyExistsError => 5,
            BinExistsError => 6,
            ClusterKeyMismatch => 7,
            ServerMemError => 8,
            Timeout => 9,
            AlwaysForbidden => 10,
            PartitionUnavailable => 11,
            BinTypeError => 12,
            RecordTooBig => 13,
            KeyBusy => 14,
            ScanAbort => 15,
            UnsupportedFeature => 16,
            BinNotFound => 17,
            DeviceOverload => 18,
            KeyMismatch => 19,
            InvalidNamespace => 20,
            BinNameTooLong => 21,
            FailForbidden => 22,
            ElementNotFound => 23,
            ElementExists => 24,
            EnterpriseOnly => 25,
            OpNotApplicable => 26,
            FilteredOut => 27,
            LostConflict => 28,
            QueryEnd => 50,
            SecurityNotSupported => 51,
            SecurityNotEnabled => 52,
            SecuritySchemeNotSupported => 53,
            InvalidCommand => 54,
            InvalidField => 55,
            IllegalState => 56,
            InvalidUser => 60,
            UserAlreadyExists => 61,
            InvalidPassword => 62,
            ExpiredPassword => 63,
            ForbiddenPassword => 64,
            InvalidCredential => 65,
            ExpiredSession => 66,
            InvalidRole => 70,
            RoleAlreadyExists => 71,
            InvalidPrivilege => 72,
            InvalidWhitelist => 73,
            QuotasNotEnabled => 74,
            InvalidQuota => 75,
            NotAuthenticated => 80,
            RoleViolation => 81,
            NotWhitelisted => 82,
            QuotaExceeded => 83,
            UdfBadResponse => 100,
            BatchDisabled => 150,
            BatchMaxRequestsExceeded => 151,
            BatchQueuesFull => 152,
            GeoInvalidGeojson => 160,
            IndexFound => 200,
            IndexNotFound => 201,
            IndexOom => 202,
            IndexNotReadable => 203,
            IndexGeneric => 204,
            IndexNameMaxLen => 205,
            IndexMaxCount => 206,
            QueryAborted => 210,
            QueryQueueFull => 211,
            QueryTimeout => 212,
            QueryGeneric => 213,
            QueryNetioErr => 214,
            QueryDuplicate => 215,
            AerospikeErrUdfNotFound => 1301,
            AerospikeErrLuaFileNotFound => 1302,
            Unknown(code) => code,
        }
    }

    /// Human readable description.
    pub fn description(&self) -> &'static str {
        use ResultCode::*;
        match self {
            GrpcError => "GRPC error",
            NetworkError => "Network error",
            CommonError => "Common, uncategorized error",
            MaxRetriesExceeded => "Max retries exceeded",
            MaxErrorRate => "Max errors limit reached for node",
            RackNotDefined => "Requested rack for node/namespace was not defined in the cluster",
            InvalidClusterPartitionMap => "Cluster has an invalid partition map",
            ServerNotAvailable => "Server is not accepting requests",
            ClusterNameMismatch => "Cluster name does not match the configured name",
            RecordsetClosed => "Recordset has already been closed or cancelled",
            NoAvailableConnectionsToNode => "No available connections to the node",
            TypeNotSupported => "Type cannot be converted to a wire value",
            CommandRejected => "Command rejected",
            QueryTerminated => "Query terminated",
            ScanTerminated => "Scan terminated",
            InvalidNodeError => "Invalid node",
            ParseError => "Parse error",
            SerializeError => "Serialize error",
            Ok => "ok",
            ServerError => "Server error",
            KeyNotFoundError => "Key not found",
            GenerationError => "Generation error",
            ParameterError => "Parameter error",
            KeyExistsError => "Key already exists",
            BinExistsError => "Bin already exists",
            ClusterKeyMismatch => "Cluster key mismatch",
            ServerMemError => "Server memory error",
            Timeout => "Timeout",
            AlwaysForbidden => "Operation not allowed in current configuration",
            PartitionUnavailable => "Partition not available",
            BinTypeError => "Bin type error",
            RecordTooBig => "Record too big",
            KeyBusy => "Hot key",
            ScanAbort => "Scan aborted",
            UnsupportedFeature => "Unsupported Server Feature",
            BinNotFound => "Bin not found",
            DeviceOverload => "Device overload",
            KeyMismatch => "Key mismatch",
            InvalidNamespace => "Namespace not found",
            BinNameTooLong => "Bin name length greater than 15 characters or maximum bins exceeded",
            FailForbidden => "Operation not allowed at this time",
            ElementNotFound => "Element not found",
            ElementExists => "Element exists",
            EnterpriseOnly => "Enterprise only",
            OpNotApplicable => "Operation not applicable",
            FilteredOut => "Transaction filtered out",
            LostConflict => "Transaction failed due to conflict with XDR",
            QueryEnd => "Query end",
            SecurityNotSupported => "Security not supported",
            SecurityNotEnabled => "Security not enabled",
            SecuritySchemeNotSupported => "Security scheme not supported",
            InvalidCommand => "Invalid command",
            InvalidField => "Invalid field",
            IllegalState => "Illegal state",
            InvalidUser => "Invalid user",
            UserAlreadyExists => "User already exists",
            InvalidPassword => "Invalid password",
            ExpiredPassword => "Expired password",
            ForbiddenPassword => "Forbidden password",
            InvalidCredential => "Invalid credential",
            ExpiredSession => "Login session expired",
            InvalidRole => "Invalid role",
            RoleAlreadyExists => "Role already exists",
            InvalidPrivilege => "Invalid privilege",
            InvalidWhitelist => "Invalid whitelist",
            QuotasNotEnabled => "Quotas not enabled",
            InvalidQuota => "Invalid quota",
            NotAuthenticated => "Not authenticated",
            RoleViolation => "Role violation",
            NotWhitelisted => "Command not whitelisted",
            QuotaExceeded => "Quota exceeded",
            UdfBadResponse => "UDF returned error",
            BatchDisabled => "Batch functionality has been disabled",
            BatchMaxRequestsExceeded => "Batch max requests have been exceeded",
            BatchQueuesFull => "All batch queues are full",
            GeoInvalidGeojson => "Invalid GeoJSON on insert/update",
            IndexFound => "Index already exists",
            IndexNotFound => "Index not found",
            IndexOom => "Index out of memory",
            IndexNotReadable => "Index not readable",
            IndexGeneric => "Index error",
            IndexNameMaxLen => "Index name max length exceeded",
            IndexMaxCount => "Index count exceeds max",
            QueryAborted => "Query aborted",
            QueryQueueFull => "Query queue full",
            QueryTimeout => "Query timeout",
            QueryGeneric => "Query error",
            QueryNetioErr => "Query NetIO error on server",
            QueryDuplicate => "Duplicate TaskId sent for the statement",
            AerospikeErrUdfNotFound => "UDF does not exist",
            AerospikeErrLuaFileNotFound => "LUA package/file does not exist",
            Unknown(_) => "Unknown result code",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

//! The 17-valued gRPC status code set (§3 Status Code) and its JS-visible
//! namespace (`grpc.status`). Equivalent in spirit to the teacher's use of
//! `tonic::Code`, but exposed as our own enum since the bridge owns the
//! canonical names scripts see, independent of whichever `Transport` is
//! injected underneath.

use std::fmt;

/// One of the 17 standard gRPC status codes. `Ok` is not an error; every
/// other variant is (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// Every status code in ascending canonical order, for P1-style exhaustive
/// round-trip checks and for building the `grpc.status` namespace table.
pub const ALL: [StatusCode; 17] = [
    StatusCode::Ok,
    StatusCode::Cancelled,
    StatusCode::Unknown,
    StatusCode::InvalidArgument,
    StatusCode::DeadlineExceeded,
    StatusCode::NotFound,
    StatusCode::AlreadyExists,
    StatusCode::PermissionDenied,
    StatusCode::ResourceExhausted,
    StatusCode::FailedPrecondition,
    StatusCode::Aborted,
    StatusCode::OutOfRange,
    StatusCode::Unimplemented,
    StatusCode::Internal,
    StatusCode::Unavailable,
    StatusCode::DataLoss,
    StatusCode::Unauthenticated,
];

impl StatusCode {
    /// The canonical SCREAMING_SNAKE_CASE identifier, as exported on the
    /// `grpc.status` namespace and used in `toString()` formatting.
    pub const fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    pub const fn value(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        !matches!(self, StatusCode::Ok)
    }

    /// Resolve a raw integer into a `StatusCode`. Unknown values collapse to
    /// `Unknown`, matching how a peer-originated status with an out-of-range
    /// code should be surfaced rather than rejected outright.
    pub fn from_i32(value: i32) -> StatusCode {
        ALL.iter()
            .copied()
            .find(|c| c.value() == value)
            .unwrap_or(StatusCode::Unknown)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<tonic::Code> for StatusCode {
    fn from(code: tonic::Code) -> Self {
        StatusCode::from_i32(code as i32)
    }
}

impl From<StatusCode> for tonic::Code {
    fn from(code: StatusCode) -> Self {
        tonic::Code::from_i32(code.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p1_status_completeness_round_trip() {
        for code in ALL {
            assert_eq!(StatusCode::from_i32(code.value()), code);
            assert_eq!(StatusCode::from_i32(code.value()).name(), code.name());
        }
    }

    #[test]
    fn canonical_values_match_spec() {
        assert_eq!(StatusCode::Ok.value(), 0);
        assert_eq!(StatusCode::Cancelled.value(), 1);
        assert_eq!(StatusCode::Unauthenticated.value(), 16);
    }

    #[test]
    fn ok_is_not_an_error() {
        assert!(!StatusCode::Ok.is_error());
        for code in ALL.iter().skip(1) {
            assert!(code.is_error());
        }
    }

    #[test]
    fn unknown_integer_collapses_to_unknown() {
        assert_eq!(StatusCode::from_i32(999), StatusCode::Unknown);
    }

    #[test]
    fn tonic_code_round_trip() {
        for code in ALL {
            let tonic_code: tonic::Code = code.into();
            assert_eq!(StatusCode::from(tonic_code), code);
        }
    }
}

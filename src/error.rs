//! Session Error Taxonomy
//!
//! Fatal session errors are surfaced through `Session::notify_error` and
//! mapped to the peer error-info code the client observes at disconnect.
//! Channel-local protocol violations never reach this module; they tear
//! down only the offending DVC.

use thiserror::Error;

/// Peer error-info codes reported to the client at disconnect.
///
/// These mirror the server-side error-info values of [MS-RDPBCGR]
/// 2.2.5.1.1; the peer library owns the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorInfo {
    /// No error has been recorded.
    None,
    /// The client capability set was refused.
    BadCaps,
    /// Invalid TS_UD_CS_MONITOR block or DISP monitor layout.
    BadMonitorData,
    /// The display driver (capture side) failed; the stack must close.
    CloseStackOnDriverFailure,
    /// Damage detection or encode session allocation failed.
    GraphicsSubsystemFailed,
}

/// Fatal session error kinds, in the order `notify_error` maps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Refused capability set.
    #[error("client capability set refused")]
    BadCaps,

    /// Invalid monitor data from TS_UD_CS_MONITOR or DISP.
    #[error("invalid monitor data")]
    BadMonitorData,

    /// Unrecoverable capture-side failure while preparing surfaces.
    #[error("graphics driver failure, closing stack")]
    CloseStackOnDriverFailure,

    /// Encode session or damage detector allocation failure.
    #[error("graphics subsystem failed")]
    GraphicsSubsystemFailed,
}

impl SessionError {
    /// Map to the error-info code the peer reports at disconnect.
    pub fn error_info(self) -> ErrorInfo {
        match self {
            SessionError::BadCaps => ErrorInfo::BadCaps,
            SessionError::BadMonitorData => ErrorInfo::BadMonitorData,
            SessionError::CloseStackOnDriverFailure => ErrorInfo::CloseStackOnDriverFailure,
            SessionError::GraphicsSubsystemFailed => ErrorInfo::GraphicsSubsystemFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_mapping() {
        assert_eq!(SessionError::BadCaps.error_info(), ErrorInfo::BadCaps);
        assert_eq!(
            SessionError::BadMonitorData.error_info(),
            ErrorInfo::BadMonitorData
        );
        assert_eq!(
            SessionError::CloseStackOnDriverFailure.error_info(),
            ErrorInfo::CloseStackOnDriverFailure
        );
        assert_eq!(
            SessionError::GraphicsSubsystemFailed.error_info(),
            ErrorInfo::GraphicsSubsystemFailed
        );
    }
}

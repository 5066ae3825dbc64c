use thiserror::Error;

/// Well-known failures of a remote pull.
///
/// These abort the pull and are reported with a fixed message.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("Unable to connect to host")]
  Connection { reason: String },

  #[error("Authentication with provided token failed")]
  Authentication,
}

/// A kind name that does not name a RapidPro record kind.
#[derive(Debug, Error)]
#[error("Invalid kind \"{0}\"")]
pub struct UnknownKind(pub String);

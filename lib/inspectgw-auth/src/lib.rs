//! Authentication collaborators (§6, §10.5, §11 of SPEC_FULL.md).
//!
//! `Authenticator` is the per-login guard-code source the session protocol
//! handler (C6) calls into when the upstream demands a code. The built-in
//! `TotpAuthenticator` computes a device-code from a bot's shared secret;
//! anything else is handed off to a pluggable `AuthenticationHandler`.

mod totp;

pub use totp::{generate_totp_code, TotpError};

/// The kind of guard code the upstream is asking for. Only `DeviceCode` is
/// served by the built-in authenticator — every other kind must come from a
/// pluggable `AuthenticationHandler` (e.g. one that polls an email inbox).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GuardKind {
    DeviceCode,
    EmailCode,
    Unknown(u32),
}

/// Supplies a guard code on demand for a single bot login attempt.
pub trait Authenticator: Send {
    /// Returns the code for the requested guard kind, or an empty string if
    /// this authenticator cannot answer that kind (matches the Go source's
    /// `TwoFactorAuthenticator.GetCode`, which returns `""` for anything but
    /// `DeviceCode`).
    fn get_code(&self, kind: GuardKind) -> String;
}

/// Built-in authenticator for bots configured with a TOTP shared secret.
pub struct TotpAuthenticator {
    shared_secret: String,
}

impl TotpAuthenticator {
    pub fn new(shared_secret: impl Into<String>) -> TotpAuthenticator {
        TotpAuthenticator {
            shared_secret: shared_secret.into(),
        }
    }
}

impl Authenticator for TotpAuthenticator {
    fn get_code(&self, kind: GuardKind) -> String {
        if kind != GuardKind::DeviceCode {
            return String::new();
        }

        let now = inspectgw_common::time::timestamp_secs();
        match generate_totp_code(&self.shared_secret, now) {
            Ok(code) => code,
            Err(_) => String::new(),
        }
    }
}

/// Pluggable collaborator that supplies an `Authenticator` for bots without
/// a shared secret (e.g. one that relies on an operator-supplied email
/// code). No default implementation is provided — a gateway with no handler
/// configured simply cannot log such bots in, matching the Go source.
pub trait AuthenticationHandler: Send + Sync {
    fn new_authenticator(&self, bot_name: &str) -> Box<dyn Authenticator>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totp_authenticator_ignores_non_device_code_kinds() {
        let auth = TotpAuthenticator::new("JBSWY3DPEHPK3PXP");
        assert_eq!(auth.get_code(GuardKind::EmailCode), "");
    }

    #[test]
    fn totp_authenticator_returns_six_digits_for_device_code() {
        let auth = TotpAuthenticator::new("JBSWY3DPEHPK3PXP");
        let code = auth.get_code(GuardKind::DeviceCode);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}

//! What gets installed, and where.

use std::fmt;
use std::path::PathBuf;

use crate::error::CertError;

/// Host/port pair in the form `netsh http ... ipport=` expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpPort {
    /// IP address (`0.0.0.0` for a wildcard host).
    pub ip: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Extract the `ip:port` a listener prefix binds.
///
/// Takes the text after `://`, trims slashes and any path, and splits host
/// from port. `+` and `*` bind every interface and map to `0.0.0.0`;
/// `localhost` maps to `127.0.0.1`. A missing port defaults to 443 for
/// `https`/`wss` and 80 otherwise.
pub fn parse_ip_port(prefix: &str) -> Result<IpPort, CertError> {
    let (scheme, rest) = prefix
        .split_once("://")
        .ok_or_else(|| CertError::invalid_prefix(prefix, "missing '://'"))?;

    let authority = rest.trim_matches('/').split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(CertError::invalid_prefix(prefix, "missing host"));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|e| CertError::invalid_prefix(prefix, format!("invalid port: {e}")))?;
            (host, port)
        }
        _ => (authority, default_port(scheme)),
    };

    let ip = match host {
        "" => return Err(CertError::invalid_prefix(prefix, "missing host")),
        "+" | "*" => "0.0.0.0".to_string(),
        "localhost" => "127.0.0.1".to_string(),
        other => other.to_string(),
    };

    Ok(IpPort { ip, port })
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    }
}

/// A PFX certificate and the HTTP.sys binding it should serve.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// Path to the `.pfx` file.
    pub pfx_path: PathBuf,
    /// PFX passphrase. May be empty.
    pub passphrase: String,
    /// Prefix whose `ip:port` receives the certificate.
    pub binding: String,
    /// SHA-1 thumbprint of the certificate, 40 hex digits.
    pub cert_hash: String,
    /// Application GUID recorded with the binding.
    pub app_id: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("pfx_path", &self.pfx_path)
            .field("passphrase", &"<redacted>")
            .field("binding", &self.binding)
            .field("cert_hash", &self.cert_hash)
            .field("app_id", &self.app_id)
            .finish()
    }
}

impl CertificateBundle {
    /// Check every field before any tool runs.
    pub fn validate(&self) -> Result<IpPort, CertError> {
        if self.pfx_path.as_os_str().is_empty() {
            return Err(CertError::invalid_field("pfx_path", "must not be empty"));
        }

        let hash_ok =
            self.cert_hash.len() == 40 && self.cert_hash.chars().all(|c| c.is_ascii_hexdigit());
        if !hash_ok {
            return Err(CertError::invalid_field(
                "cert_hash",
                "must be 40 hexadecimal digits",
            ));
        }

        if !is_guid(self.app_id.trim_start_matches('{').trim_end_matches('}')) {
            return Err(CertError::invalid_field(
                "app_id",
                "must be a GUID like 00000000-0000-0000-0000-000000000000",
            ));
        }

        parse_ip_port(&self.binding)
    }

    /// The app id wrapped in braces, as netsh wants it.
    pub fn braced_app_id(&self) -> String {
        format!(
            "{{{}}}",
            self.app_id.trim_start_matches('{').trim_end_matches('}')
        )
    }
}

fn is_guid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()))
}

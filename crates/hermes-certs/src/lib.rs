//! Certificate binding for Hermes listeners on Windows.
//!
//! Imports a PFX bundle into the machine store and binds it to the
//! listener's `ip:port` through `netsh http`, replacing any earlier binding
//! on the same address. The external tools run behind [`CommandRunner`], so
//! the step sequence can be exercised without Windows.
//!
//! ```rust,ignore
//! use hermes_certs::{CertificateInstaller, NetshCertificateInstaller};
//!
//! let report = NetshCertificateInstaller::new().install(&bundle).await?;
//! tracing::info!(binding = %report.binding, "Certificate installed");
//! ```

pub mod bundle;
pub mod error;
pub mod installer;
pub mod runner;

pub use bundle::{parse_ip_port, CertificateBundle, IpPort};
pub use error::CertError;
pub use installer::{CertificateInstaller, InstallReport, NetshCertificateInstaller};
pub use runner::{CommandOutput, CommandRunner, TokioCommandRunner};

//! Importing a certificate and binding it to a listener address.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::bundle::{CertificateBundle, IpPort};
use crate::error::CertError;
use crate::runner::{CommandRunner, TokioCommandRunner};

const CERTUTIL: &str = "certutil";
const NETSH: &str = "netsh";

/// What an installation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// The address the certificate is now bound to.
    pub binding: IpPort,
    /// Whether an earlier binding on the same address was removed first.
    pub replaced_existing: bool,
}

/// Installs a certificate bundle so the listener can serve TLS.
#[async_trait]
pub trait CertificateInstaller: Send + Sync {
    /// Import the certificate and bind it to the bundle's address.
    async fn install(&self, bundle: &CertificateBundle) -> Result<InstallReport, CertError>;
}

/// Installer driving `certutil` and `netsh http` on Windows.
///
/// Steps, in order:
/// 1. `certutil -f -p <passphrase> -importpfx <path>`
/// 2. `netsh http show sslcert` to find an existing binding for `ip:port`
/// 3. `netsh http delete sslcert ipport=<ip:port>` if one exists
/// 4. `netsh http add sslcert ipport=<ip:port> certhash=<hash> appid={<guid>}`
///
/// Requires an elevated process.
#[derive(Debug, Clone, Default)]
pub struct NetshCertificateInstaller<R = TokioCommandRunner> {
    runner: R,
}

impl NetshCertificateInstaller {
    /// Creates an installer that spawns real processes.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: CommandRunner> NetshCertificateInstaller<R> {
    /// Creates an installer with a custom runner.
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    /// The runner in use.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn import_pfx(&self, bundle: &CertificateBundle) -> Result<(), CertError> {
        let args = vec![
            "-f".to_string(),
            "-p".to_string(),
            bundle.passphrase.clone(),
            "-importpfx".to_string(),
            bundle.pfx_path.display().to_string(),
        ];
        self.runner.run(CERTUTIL, &args).await?.check(CERTUTIL)?;
        info!(path = %bundle.pfx_path.display(), "Certificate imported");
        Ok(())
    }

    async fn is_bound(&self, ip_port: &IpPort) -> Result<bool, CertError> {
        let args = strings(&["http", "show", "sslcert"]);
        let output = self.runner.run(NETSH, &args).await?;
        if !output.success() {
            // An empty binding table is reported as a failure on some systems.
            warn!(status = ?output.status, "Could not list SSL bindings, assuming none");
            return Ok(false);
        }
        Ok(output.stdout.contains(&ip_port.to_string()))
    }

    async fn delete_binding(&self, ip_port: &IpPort) -> Result<(), CertError> {
        let args = vec![
            "http".to_string(),
            "delete".to_string(),
            "sslcert".to_string(),
            format!("ipport={ip_port}"),
        ];
        self.runner.run(NETSH, &args).await?.check(NETSH)?;
        info!(ipport = %ip_port, "Existing SSL binding removed");
        Ok(())
    }

    async fn add_binding(
        &self,
        bundle: &CertificateBundle,
        ip_port: &IpPort,
    ) -> Result<(), CertError> {
        let args = vec![
            "http".to_string(),
            "add".to_string(),
            "sslcert".to_string(),
            format!("ipport={ip_port}"),
            format!("certhash={}", bundle.cert_hash),
            format!("appid={}", bundle.braced_app_id()),
        ];
        self.runner.run(NETSH, &args).await?.check(NETSH)?;
        info!(ipport = %ip_port, "SSL binding added");
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> CertificateInstaller for NetshCertificateInstaller<R> {
    #[instrument(skip_all, fields(binding = %bundle.binding))]
    async fn install(&self, bundle: &CertificateBundle) -> Result<InstallReport, CertError> {
        let ip_port = bundle.validate()?;

        self.import_pfx(bundle).await?;

        let replaced_existing = self.is_bound(&ip_port).await?;
        if replaced_existing {
            self.delete_binding(&ip_port).await?;
        }

        self.add_binding(bundle, &ip_port).await?;

        Ok(InstallReport {
            binding: ip_port,
            replaced_existing,
        })
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Records every call and replies from a script.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        replies: Mutex<VecDeque<CommandOutput>>,
    }

    impl ScriptedRunner {
        fn replying(replies: Vec<CommandOutput>) -> Self {
            Self {
                calls: Mutex::default(),
                replies: Mutex::new(replies.into()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .map(|(program, args)| format!("{program} {}", args.join(" ")))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CertError> {
            self.calls
                .lock()
                .push((program.to_string(), args.to_vec()));
            Ok(self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| CommandOutput::ok("")))
        }
    }

    fn bundle() -> CertificateBundle {
        CertificateBundle {
            pfx_path: PathBuf::from("server.pfx"),
            passphrase: "pw".to_string(),
            binding: "https://+:20005/".to_string(),
            cert_hash: "0123456789abcdef0123456789abcdef01234567".to_string(),
            app_id: "6f1c9b2e-3a4d-4e5f-8a9b-0c1d2e3f4a5b".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fresh_install_runs_import_show_add() {
        let installer = NetshCertificateInstaller::with_runner(ScriptedRunner::default());

        let report = installer.install(&bundle()).await.unwrap();

        assert!(!report.replaced_existing);
        assert_eq!(report.binding.to_string(), "0.0.0.0:20005");
        assert_eq!(
            installer.runner().calls(),
            vec![
                "certutil -f -p pw -importpfx server.pfx",
                "netsh http show sslcert",
                "netsh http add sslcert ipport=0.0.0.0:20005 \
                 certhash=0123456789abcdef0123456789abcdef01234567 \
                 appid={6f1c9b2e-3a4d-4e5f-8a9b-0c1d2e3f4a5b}",
            ]
        );
    }

    #[tokio::test]
    async fn test_existing_binding_is_replaced() {
        let show = "    IP:port                      : 0.0.0.0:20005\n    Certificate Hash : aa";
        let runner = ScriptedRunner::replying(vec![
            CommandOutput::ok("CertUtil: -importPFX command completed successfully."),
            CommandOutput::ok(show),
        ]);
        let installer = NetshCertificateInstaller::with_runner(runner);

        let report = installer.install(&bundle()).await.unwrap();

        assert!(report.replaced_existing);
        let calls = installer.runner().calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2], "netsh http delete sslcert ipport=0.0.0.0:20005");
        assert!(calls[3].starts_with("netsh http add sslcert"));
    }

    #[tokio::test]
    async fn test_failed_import_stops_early() {
        let runner = ScriptedRunner::replying(vec![CommandOutput::failed(2, "bad password")]);
        let installer = NetshCertificateInstaller::with_runner(runner);

        let err = installer.install(&bundle()).await.unwrap_err();

        assert!(matches!(err, CertError::CommandFailed { ref program, .. } if program == "certutil"));
        assert_eq!(installer.runner().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_listing_assumes_unbound() {
        let runner = ScriptedRunner::replying(vec![
            CommandOutput::ok(""),
            CommandOutput::failed(1, "The system cannot find the file specified."),
        ]);
        let installer = NetshCertificateInstaller::with_runner(runner);

        let report = installer.install(&bundle()).await.unwrap();

        assert!(!report.replaced_existing);
        assert_eq!(installer.runner().calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_add_is_reported() {
        let runner = ScriptedRunner::replying(vec![
            CommandOutput::ok(""),
            CommandOutput::ok(""),
            CommandOutput::failed(1, "SSL Certificate add failed, Error: 183"),
        ]);
        let installer = NetshCertificateInstaller::with_runner(runner);

        let err = installer.install(&bundle()).await.unwrap_err();
        assert!(err.to_string().contains("Error: 183"));
    }

    #[tokio::test]
    async fn test_invalid_bundle_runs_nothing() {
        let installer = NetshCertificateInstaller::with_runner(ScriptedRunner::default());
        let mut b = bundle();
        b.binding = "no-scheme".to_string();

        let err = installer.install(&b).await.unwrap_err();

        assert!(matches!(err, CertError::InvalidPrefix { .. }));
        assert!(installer.runner().calls().is_empty());
    }
}

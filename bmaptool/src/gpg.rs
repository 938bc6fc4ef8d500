//! A [`TrustStore`] backed by the system `gpg` binary.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use bmaptool_core::signature::TrustStore;
use tempfile::NamedTempFile;
use tracing::debug;

/// Checks signatures against the keys of a GnuPG home directory. Without an
/// explicit directory, `gpg` uses `GNUPGHOME` or its default.
pub struct GpgTrustStore {
    home: Option<PathBuf>,
}

impl GpgTrustStore {
    pub fn new(home: Option<PathBuf>) -> Self {
        Self { home }
    }

    fn verify(&self, files: &[&NamedTempFile]) -> io::Result<bool> {
        let mut cmd = Command::new("gpg");
        cmd.args(["--batch", "--no-tty", "--status-fd", "1"]);
        if let Some(home) = &self.home {
            cmd.arg("--homedir").arg(home);
        }
        cmd.arg("--verify");
        for file in files {
            cmd.arg(file.path());
        }

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        let status = String::from_utf8_lossy(&output.stdout);
        let good = output.status.success()
            && status
                .lines()
                .any(|l| l.starts_with("[GNUPG:] GOODSIG "));

        if !good {
            debug!(
                status = %output.status,
                "gpg rejected the signature: {}",
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }

        Ok(good)
    }
}

fn temp_file_with(data: &[u8]) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

impl TrustStore for GpgTrustStore {
    fn verify_detached(&self, document: &[u8], signature: &[u8]) -> io::Result<bool> {
        let signature = temp_file_with(signature)?;
        let document = temp_file_with(document)?;
        self.verify(&[&signature, &document])
    }

    fn verify_clearsigned(&self, message: &[u8]) -> io::Result<bool> {
        let message = temp_file_with(message)?;
        self.verify(&[&message])
    }
}

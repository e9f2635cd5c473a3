//! Malware scan hook.
//!
//! No scanning engine is wired in yet. The hook only recognises the EICAR
//! antivirus test file, so the rejection path can be exercised end to end.
//! Uploads that are rejected here never reach storage.

use tracing::debug;

const EICAR_SIGNATURE: &[u8] =
    br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { reason: String },
}

pub async fn scan_upload(file_name: &str, data: &[u8]) -> ScanVerdict {
    debug!(file_name, size_bytes = data.len(), "Malware scan hook invoked");
    if data
        .windows(EICAR_SIGNATURE.len())
        .any(|window| window == EICAR_SIGNATURE)
    {
        return ScanVerdict::Infected {
            reason: "EICAR test signature".to_string(),
        };
    }
    ScanVerdict::Clean
}

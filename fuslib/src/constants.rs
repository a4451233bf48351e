/// Hardcoded fixed key used to AES-256 encrypt/decrypt nonces. Its characters
/// also form the alphabet that session keys are derived from.
pub const FIXED_KEY: &[u8] = b"hqzdurufm2c8mf6bsjezu1qgveouv7c7";

/// Suffix appended to "flexible keys", which are keys derived from the fixed
/// key based on the characters of a nonce
pub const FLEXIBLE_KEY_SUFFIX: &[u8] = b"w13r4cvf4hctaujv";

/// Host serving the authenticated metadata and control endpoints
pub const FUS_BASE_URL: &str = "https://neofussvr.sslcs.cdngc.net";
/// Host serving firmware binaries
pub const CLOUD_BASE_URL: &str = "http://cloud-neofussvr.sslcs.cdngc.net";
/// Host serving the public firmware catalogue
pub const FOTA_BASE_URL: &str = "https://fota-cloud-dn.ospserver.net";

pub const NONCE_ENDPOINT: &str = "NF_DownloadGenerateNonce.do";
pub const BINARY_INFORM_ENDPOINT: &str = "NF_DownloadBinaryInform.do";
pub const BINARY_INIT_ENDPOINT: &str = "NF_DownloadBinaryInitForMass.do";
pub const BINARY_DOWNLOAD_ENDPOINT: &str = "NF_DownloadBinaryForMass.do";

/// Value of the `CLIENT_PRODUCT` field sent with metadata requests
pub const CLIENT_PRODUCT: &str = "Smart Switch";

/// User agent of the official desktop client
pub const USER_AGENT: &str = "Kies2.0_FUS";

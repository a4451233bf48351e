use std::{
    borrow::Cow,
    fmt,
};

use log::debug;
use thiserror::Error;
use xmltree::Element;

use crate::{
    constants::{
        BINARY_INFORM_ENDPOINT, BINARY_INIT_ENDPOINT, CLIENT_PRODUCT,
    },
    crypto,
    session::{self, FusRequest, FusSession, ProtocolError, TransportError},
    version::FwVersion,
    xml,
};

/// FUS status for a successful lookup
const STATUS_OK: &str = "200";
/// `ACCESS_MODE` value used by the desktop client
const ACCESS_MODE: &str = "2";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Could not find field '{0}' in FUS response")]
    MissingField(String),
    #[error("Firmware not found (FUS status {0})")]
    NotFound(String),
    #[error("Could not parse the value for field '{field}': '{value}'")]
    BadField {
        field: String,
        value: String,
    },
    #[error("Unsupported encryption scheme for file: {0}")]
    UnsupportedScheme(String),
    #[error("XML parse error: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Whether a binary is the regular (home) image or the factory image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BinaryNature {
    #[default]
    Home,
    Factory,
}

impl BinaryNature {
    /// Wire value of the `BINARY_NATURE` field.
    pub fn as_field(self) -> &'static str {
        match self {
            Self::Home => "0",
            Self::Factory => "1",
        }
    }
}

impl fmt::Display for BinaryNature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Home => f.write_str("home"),
            Self::Factory => f.write_str("factory"),
        }
    }
}

/// Firmware key derivation scheme, selected by the file name suffix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecryptScheme {
    /// `.enc2`: key from region, model and version
    V2,
    /// `.enc4`: key from the latest version scrambled with a logic value
    V4,
}

impl DecryptScheme {
    fn from_file_name(file_name: &str) -> Result<Self, MetadataError> {
        match file_name.chars().last() {
            Some('2') => Ok(Self::V2),
            Some('4') => Ok(Self::V4),
            _ => Err(MetadataError::UnsupportedScheme(file_name.to_owned())),
        }
    }
}

/// Information about a single firmware binary, as reported by
/// `NF_DownloadBinaryInform.do`.
#[derive(Clone, Debug)]
pub struct FirmwareMetadata {
    /// Requested firmware version
    pub version: FwVersion,
    /// Version that the V4 key is derived from
    pub latest_version: String,
    /// Model number
    pub model: String,
    /// Region code
    pub region: String,
    /// Directory of the binary on the cloud host
    pub model_path: String,
    /// Release notes URL
    pub description_url: String,
    /// [Home] Logic value for decryption
    pub logic_value_home: String,
    /// [Factory] Logic value for decryption
    pub logic_value_factory: String,
    /// Friendly OS version name
    pub os_version: String,
    /// Firmware file name on the cloud host
    pub file_name: String,
    pub nature: BinaryNature,
    /// Firmware size in bytes
    pub size: u64,
    /// Firmware CRC32 checksum (big-endian)
    pub crc: [u8; 4],
    pub scheme: DecryptScheme,
    /// AES-128 key for decrypting the binary
    pub key: [u8; 16],
    /// Firmware OS/platform
    pub platform: Option<String>,
    /// Human-readable model/marketing name
    pub model_display_name: Option<String>,
    /// Firmware modification date
    pub last_modified: Option<String>,
}

impl FirmwareMetadata {
    /// Query FUS for the metadata of a firmware version.
    pub async fn fetch(
        session: &mut FusSession,
        version: &FwVersion,
        model: &str,
        region: &str,
        nature: BinaryNature,
    ) -> Result<Self, MetadataError> {
        let version_str = version.to_string();
        let logic_check = crypto::logic_check(&version_str, session.nonce()?);

        let body = session::build_request_xml(&[
            ("ACCESS_MODE", ACCESS_MODE),
            ("CLIENT_PRODUCT", CLIENT_PRODUCT),
            ("BINARY_NATURE", nature.as_field()),
            ("DEVICE_FW_VERSION", &version_str),
            ("DEVICE_LOCAL_CODE", region),
            ("DEVICE_MODEL_NAME", model),
            ("LOGIC_CHECK", &logic_check),
        ]).map_err(ProtocolError::from)?;

        debug!("FUS request: {:?}", xml::to_utf8_or_error_string(&body));

        let response = session.send(FusRequest::post(BINARY_INFORM_ENDPOINT).body(body)).await?;
        let response = TransportError::check_status(response)?;
        let url = response.url().to_string();
        let data = response.bytes().await
            .map_err(|source| TransportError::Body { url, source })?;

        debug!("FUS response: {:?}", xml::to_utf8_or_error_string(&data));

        let root = Element::parse(data.as_ref())?;

        Self::from_xml(&root, version)
    }

    /// Parse and validate a `NF_DownloadBinaryInform.do` response document.
    pub fn from_xml(root: &Element, version: &FwVersion) -> Result<Self, MetadataError> {
        // HTTP 200, but there might still be a FUS error
        let status = xml::child_text(root, &["FUSBody", "Results", "Status"])
            .ok_or_else(|| MetadataError::MissingField("Status".to_owned()))?;
        if status.trim() != STATUS_OK {
            return Err(MetadataError::NotFound(status.into_owned()));
        }

        macro_rules! get_value {
            ($name:expr) => {
                get_fus_field(root, $name)
                    .ok_or_else(|| MetadataError::MissingField($name.to_owned()))?
            }
        }
        macro_rules! get_string {
            ($name:expr) => {
                get_value!($name).into_owned()
            }
        }
        macro_rules! get_parsed {
            ($name:expr) => {
                {
                    let value = get_value!($name);
                    value.trim().parse().map_err(|_| MetadataError::BadField {
                        field: $name.to_owned(),
                        value: value.to_string(),
                    })?
                }
            }
        }

        let nature: u8 = get_parsed!("BINARY_NATURE");
        let nature = match nature {
            0 => BinaryNature::Home,
            1 => BinaryNature::Factory,
            n => return Err(MetadataError::BadField {
                field: "BINARY_NATURE".to_owned(),
                value: n.to_string(),
            }),
        };
        let model = get_string!("DEVICE_MODEL_NAME");
        let region = get_string!("DEVICE_LOCAL_CODE");
        let model_path = get_string!("MODEL_PATH");
        let description_url = get_string!("DESCRIPTION");
        let logic_value_home = get_string!("LOGIC_VALUE_HOME");
        let logic_value_factory = get_string!("LOGIC_VALUE_FACTORY");
        let os_version = get_string!("CURRENT_OS_VERSION");
        let file_name = get_string!("BINARY_NAME");
        let size = get_parsed!("BINARY_BYTE_SIZE");
        let crc = u32::to_be_bytes(get_parsed!("BINARY_CRC"));

        let scheme = DecryptScheme::from_file_name(&file_name)?;

        let version_str = version.to_string();
        let latest_version = xml::child_text(root, &["FUSBody", "Results", "LATEST_FW_VERSION", "Data"])
            .filter(|v| !v.is_empty())
            .map_or_else(|| version_str.clone(), Cow::into_owned);

        let key = match scheme {
            DecryptScheme::V2 => crypto::derive_key_v2(&version_str, &model, &region),
            DecryptScheme::V4 => crypto::derive_key_v4(
                nature == BinaryNature::Factory,
                &latest_version,
                &logic_value_home,
                &logic_value_factory,
            ),
        };

        Ok(Self {
            version: version.clone(),
            latest_version,
            model,
            region,
            model_path,
            description_url,
            logic_value_home,
            logic_value_factory,
            os_version,
            file_name,
            nature,
            size,
            crc,
            scheme,
            key,
            platform: get_fus_field(root, "DEVICE_PLATFORM").map(Cow::into_owned),
            model_display_name: get_fus_field(root, "DEVICE_MODEL_DISPLAYNAME").map(Cow::into_owned),
            last_modified: get_fus_field(root, "LAST_MODIFIED").map(Cow::into_owned),
        })
    }

    /// Inform the service of the intention to download. The response body
    /// carries nothing of interest, but the server may rotate the nonce.
    pub async fn initialize_transfer(&self, session: &mut FusSession) -> Result<(), MetadataError> {
        let logic_check = crypto::logic_check_file_name(&self.file_name, session.nonce()?);

        let body = session::build_request_xml(&[
            ("BINARY_FILE_NAME", &self.file_name),
            ("LOGIC_CHECK", &logic_check),
        ]).map_err(ProtocolError::from)?;

        debug!("FUS request: {:?}", xml::to_utf8_or_error_string(&body));

        let response = session.send(FusRequest::post(BINARY_INIT_ENDPOINT).body(body)).await?;
        TransportError::check_status(response)?;

        Ok(())
    }

    /// File name with the `.enc2`/`.enc4` extension removed.
    pub fn decrypted_file_name(&self) -> &str {
        self.file_name.strip_suffix(".enc2")
            .or_else(|| self.file_name.strip_suffix(".enc4"))
            .unwrap_or(&self.file_name)
    }

    /// Query string for `NF_DownloadBinaryForMass.do`.
    pub fn download_query(&self) -> String {
        format!("file={}{}", self.model_path, self.file_name)
    }
}

fn get_fus_field<'a>(elem: &'a Element, field: &str) -> Option<Cow<'a, str>> {
    xml::child_text(elem, &["FUSBody", "Put", field, "Data"])
}

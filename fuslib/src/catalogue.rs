use std::str;

use log::debug;
use reqwest::StatusCode;
use thiserror::Error;
use xmltree::Element;

use crate::{
    constants::FOTA_BASE_URL,
    session::TransportError,
    version::normalize_version,
    xml,
};

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("No firmware catalogue for model {model} in region {region}")]
    NotFound {
        model: String,
        region: String,
    },
    #[error("Could not find '{0}' in firmware catalogue")]
    MissingField(String),
    #[error("Could not parse the value for '{field}': '{value}'")]
    BadField {
        field: String,
        value: String,
    },
    #[error("XML parse error: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The newest firmware published for a device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LatestFirmware {
    pub version: String,
    pub normalized: String,
    /// Android API level
    pub android_level: Option<u32>,
}

/// An older firmware that devices can still upgrade from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistoricalFirmware {
    pub version: String,
    pub normalized: String,
    pub replay_count: u32,
    /// Size of the delta in bytes
    pub file_size: u64,
}

/// Contents of a device's `version.xml` on the FOTA server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwareHistory {
    pub latest: LatestFirmware,
    pub old: Vec<HistoricalFirmware>,
}

fn parse_attr<T: str::FromStr>(elem: &Element, name: &str) -> Result<T, CatalogueError> {
    let value = xml::attribute(elem, name)
        .ok_or_else(|| CatalogueError::MissingField(format!("{}@{name}", elem.name)))?;

    value.trim().parse().map_err(|_| CatalogueError::BadField {
        field: format!("{}@{name}", elem.name),
        value: value.to_owned(),
    })
}

impl FirmwareHistory {
    pub fn from_xml(root: &Element) -> Result<Self, CatalogueError> {
        let versions = root.get_child("firmware")
            .and_then(|e| e.get_child("version"))
            .ok_or_else(|| CatalogueError::MissingField("firmware/version".to_owned()))?;

        let latest_elem = versions.get_child("latest")
            .ok_or_else(|| CatalogueError::MissingField("firmware/version/latest".to_owned()))?;
        let version = xml::child_text(latest_elem, &[]).unwrap_or_default().trim().to_owned();
        let android_level = match xml::attribute(latest_elem, "o") {
            Some(_) => Some(parse_attr(latest_elem, "o")?),
            None => None,
        };

        let latest = LatestFirmware {
            normalized: normalize_version(&version),
            version,
            android_level,
        };

        let mut old = vec![];

        // Devices without upgrade paths have no upgrade element at all
        if let Some(upgrade) = versions.get_child("upgrade") {
            for value in upgrade.children.iter().filter_map(|n| n.as_element()) {
                let version = xml::child_text(value, &[]).unwrap_or_default().trim().to_owned();

                old.push(HistoricalFirmware {
                    normalized: normalize_version(&version),
                    version,
                    replay_count: parse_attr(value, "rcount")?,
                    file_size: parse_attr(value, "fwsize")?,
                });
            }
        }

        Ok(Self { latest, old })
    }

    /// All listed versions, newest first.
    pub fn versions(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.latest.version.as_str())
            .chain(self.old.iter().map(|f| f.version.as_str()))
    }

    /// Check whether `version` is listed. With `normalized`, versions are
    /// compared in their four-segment form.
    pub fn contains(&self, version: &str, normalized: bool) -> bool {
        if normalized {
            let version = normalize_version(version);

            self.latest.normalized == version
                || self.old.iter().any(|f| f.normalized == version)
        } else {
            self.latest.version == version
                || self.old.iter().any(|f| f.version == version)
        }
    }
}

/// Client for the public FOTA firmware catalogue. No authentication is
/// involved.
pub struct Catalogue {
    client: reqwest::Client,
    base_url: String,
}

impl Catalogue {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, FOTA_BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, model: &str, region: &str) -> String {
        format!("{}/firmware/{region}/{model}/version.xml", self.base_url)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, TransportError> {
        debug!("FOTA URL: {url}");

        self.client.get(url).send().await
            .map_err(|source| TransportError::Request { url: url.to_owned(), source })
    }

    /// Check whether the catalogue knows the device.
    pub async fn device_exists(&self, model: &str, region: &str) -> Result<bool, TransportError> {
        let response = self.get(&self.url(model, region)).await?;

        Ok(response.status().is_success())
    }

    /// Fetch the firmware history of a device.
    pub async fn history(&self, model: &str, region: &str) -> Result<FirmwareHistory, CatalogueError> {
        let url = self.url(model, region);
        let response = self.get(&url).await?;

        // The FOTA server returns 403 when the page is not found
        if matches!(response.status(), StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
            return Err(CatalogueError::NotFound {
                model: model.to_owned(),
                region: region.to_owned(),
            });
        }

        let response = TransportError::check_status(response)?;
        let data = response.bytes().await
            .map_err(|source| TransportError::Body { url, source })?;

        debug!("FOTA response: {:?}", xml::to_utf8_or_error_string(&data));

        let root = Element::parse(data.as_ref())?;

        FirmwareHistory::from_xml(&root)
    }

    /// Check whether a firmware version is listed for a device.
    pub async fn firmware_exists(
        &self,
        model: &str,
        region: &str,
        version: &str,
        normalized: bool,
    ) -> Result<bool, CatalogueError> {
        Ok(self.history(model, region).await?.contains(version, normalized))
    }
}

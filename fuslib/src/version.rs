use std::{
    fmt,
    str::FromStr,
};

use thiserror::Error;

/// A firmware version in the `<pda>/<csc>/<phone>/<data>` form used by both FUS
/// (eg. the `DEVICE_FW_VERSION` field) and the firmware catalogue.
///
/// The catalogue frequently omits or blanks the last two segments. They are
/// filled with the `pda` segment, which is what the server expects.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FwVersion {
    /// Primary firmware version
    pub pda: String,
    /// Carrier services version
    pub csc: String,
    /// Modem/baseband version
    pub phone: String,
    /// [Unknown] `data` version
    pub data: String,
}

impl FwVersion {
    pub fn new(pda: &str, csc: &str, phone: Option<&str>, data: Option<&str>) -> Self {
        let or_pda = |s: Option<&str>| match s {
            Some(s) if !s.is_empty() => s.to_owned(),
            _ => pda.to_owned(),
        };

        Self {
            pda: pda.to_owned(),
            csc: csc.to_owned(),
            phone: or_pda(phone),
            data: or_pda(data),
        }
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.pda, self.csc, self.phone, self.data)
    }
}

impl FromStr for FwVersion {
    type Err = ParseFwVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.trim().split('/').collect();

        match segments.as_slice() {
            [pda, csc] => Ok(Self::new(pda, csc, None, None)),
            [pda, csc, phone] => Ok(Self::new(pda, csc, Some(*phone), None)),
            [pda, csc, phone, data] => Ok(Self::new(pda, csc, Some(*phone), Some(*data))),
            s if s.len() < 2 => Err(ParseFwVersionError::TooFewSegments(s.len())),
            s => Err(ParseFwVersionError::TooManySegments(s.len())),
        }
    }
}

/// Normalize a version string to its four-segment form. Strings that are not
/// versions are returned unchanged so that they can still be compared.
pub fn normalize_version(s: &str) -> String {
    match s.parse::<FwVersion>() {
        Ok(v) => v.to_string(),
        Err(_) => s.to_owned(),
    }
}

#[derive(Debug, Error)]
pub enum ParseFwVersionError {
    #[error("Version string has {0} segment(s), but at least 2 are required")]
    TooFewSegments(usize),
    #[error("Version string has {0} segments, but at most 4 are allowed")]
    TooManySegments(usize),
}

// ABOUTME: Phone-number handling for the pairing-code login flow
// ABOUTME: Normalizes local numbers, validates country prefixes, formats pairing codes

/// Prefix substituted for a leading trunk "0" when none is configured
pub const DEFAULT_LOCAL_PREFIX: &str = "62";

/// ITU-T E.164 country calling codes accepted for pairing
pub const COUNTRY_CALLING_CODES: &[&str] = &[
    "1", "7", "20", "27", "30", "31", "32", "33", "34", "36", "39", "40", "41", "43", "44", "45",
    "46", "47", "48", "49", "51", "52", "53", "54", "55", "56", "57", "58", "60", "61", "62", "63",
    "64", "65", "66", "81", "82", "84", "86", "90", "91", "92", "93", "94", "95", "98", "211",
    "212", "213", "216", "218", "220", "221", "222", "223", "224", "225", "226", "227", "228",
    "229", "230", "231", "232", "233", "234", "235", "236", "237", "238", "239", "240", "241",
    "242", "243", "244", "245", "246", "248", "249", "250", "251", "252", "253", "254", "255",
    "256", "257", "258", "260", "261", "262", "263", "264", "265", "266", "267", "268", "269",
    "290", "291", "297", "298", "299", "350", "351", "352", "353", "354", "355", "356", "357",
    "358", "359", "370", "371", "372", "373", "374", "375", "376", "377", "378", "380", "381",
    "382", "383", "385", "386", "387", "389", "420", "421", "423", "500", "501", "502", "503",
    "504", "505", "506", "507", "508", "509", "590", "591", "592", "593", "594", "595", "596",
    "597", "598", "599", "670", "672", "673", "674", "675", "676", "677", "678", "679", "680",
    "681", "682", "683", "685", "686", "687", "688", "689", "690", "691", "692", "850", "852",
    "853", "855", "856", "880", "886", "960", "961", "962", "963", "964", "965", "966", "967",
    "968", "970", "971", "972", "973", "974", "975", "976", "977", "992", "993", "994", "995",
    "996", "998",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("no phone number supplied for pairing (pass --number <value>)")]
    MissingIdentifier,

    #[error("invalid phone number '{identifier}': no known country prefix")]
    InvalidIdentifier { identifier: String },
}

/// Replace a leading trunk "0" with `local_prefix`, then keep digits only.
///
/// `"0812-3456-7890"` with prefix `"62"` becomes `"6281234567890"`.
pub fn normalize_identifier(raw: &str, local_prefix: &str) -> String {
    let trimmed = raw.trim();
    let expanded = match trimmed.strip_prefix('0') {
        Some(rest) => format!("{}{}", local_prefix, rest),
        None => trimmed.to_string(),
    };
    expanded.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalization plus validation against a prefix table
#[derive(Debug, Clone)]
pub struct IdentifierPolicy {
    local_prefix: String,
    allowed_prefixes: Vec<String>,
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_PREFIX, None)
    }
}

impl IdentifierPolicy {
    /// `allowed_prefixes` of None means the built-in country code table
    pub fn new(local_prefix: impl Into<String>, allowed_prefixes: Option<Vec<String>>) -> Self {
        Self {
            local_prefix: local_prefix.into(),
            allowed_prefixes: allowed_prefixes.unwrap_or_else(|| {
                COUNTRY_CALLING_CODES.iter().map(|c| c.to_string()).collect()
            }),
        }
    }

    pub fn is_allowed(&self, normalized: &str) -> bool {
        !normalized.is_empty()
            && self
                .allowed_prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && normalized.starts_with(prefix.as_str()))
    }

    /// Turn the operator-supplied identifier into one the transport accepts
    pub fn prepare(&self, raw: Option<&str>) -> Result<String, PairingError> {
        let raw = raw
            .filter(|r| !r.trim().is_empty())
            .ok_or(PairingError::MissingIdentifier)?;

        let normalized = normalize_identifier(raw, &self.local_prefix);
        if !self.is_allowed(&normalized) {
            return Err(PairingError::InvalidIdentifier {
                identifier: raw.to_string(),
            });
        }
        Ok(normalized)
    }
}

/// Render a pairing code as groups of four separated by hyphens ("ABCD-EFGH")
pub fn format_pairing_code(code: &str) -> String {
    let chars: Vec<char> = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

use std::fmt;
use std::path::PathBuf;

/// Represents one physical block device reported by a snapshot.
///
/// This struct holds the display-ready identity of a device, such as its
/// kernel name, vendor/model strings, and normalized size. It is populated
/// by [`crate::lsblk::take_snapshot`] and rendered into a [`Descriptor`]
/// for inventory keying and display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    /// The kernel-provided name of the device (e.g. "sdb").
    /// Unique within one snapshot.
    pub name: String,
    /// Trimmed vendor string. Blanked for the generic "ATA" vendor tag,
    /// which carries no display value.
    pub vendor: String,
    /// Trimmed model string.
    pub model: String,
    /// Normalized size in `<number> <unit>iB` form (e.g. "14.9 GiB").
    pub size: String,
    /// The device path derived from `name` (e.g. `/dev/sdb`). This is the
    /// authoritative write target.
    pub path: PathBuf,
}

impl DeviceRecord {
    /// Builds a record from the raw fields of one lsblk device object,
    /// normalizing them for display: vendor and model are trimmed, the
    /// "ATA" vendor tag is blanked, the size string is prettified, and the
    /// device path is derived from `name`.
    pub fn new(name: &str, vendor: &str, model: &str, raw_size: &str) -> Self {
        let vendor = vendor.trim();
        let vendor = if vendor == "ATA" { "" } else { vendor };

        Self {
            name: name.to_string(),
            vendor: vendor.to_string(),
            model: model.trim().to_string(),
            size: pretty_size(raw_size),
            path: PathBuf::from("/dev").join(name),
        }
    }

    /// Renders the canonical descriptor for this record:
    /// `"<vendor> <model>, <size> (<path>)"` with duplicate internal
    /// whitespace collapsed to single spaces.
    ///
    /// The path is always embedded, so two distinct devices can never
    /// produce the same descriptor.
    pub fn descriptor(&self) -> Descriptor {
        let raw = format!(
            "{} {}, {} ({})",
            self.vendor,
            self.model,
            self.size,
            self.path.display()
        );
        Descriptor(collapse_whitespace(&raw))
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor())
    }
}

/// Canonical display string identifying a device in the inventory.
///
/// Descriptors are the diff and lookup key: the inventory and the toasting
/// tracker both speak descriptors, and the front-end shows them verbatim.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Descriptor(String);

impl Descriptor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Descriptor {
    fn from(s: &str) -> Self {
        Descriptor(s.to_string())
    }
}

/// Normalizes an lsblk size string into `<number> <unit>iB` display form.
///
/// lsblk prints sizes like `"14,9G"` in comma-decimal locales; the comma
/// becomes a dot and the trailing unit letter is preserved, giving
/// `"14.9 GiB"`. Strings without a trailing unit letter pass through
/// untouched.
pub(crate) fn pretty_size(raw: &str) -> String {
    let raw = raw.trim();
    match raw.char_indices().last() {
        Some((idx, unit)) if unit.is_ascii_alphabetic() => {
            let number = raw[..idx].replace(',', ".");
            format!("{number} {unit}iB")
        }
        _ => raw.to_string(),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decoder configuration. Immutable for the duration of a decode; the
/// orchestrator takes it by reference and never mutates it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Override the logical record length reported by the container.
    pub lrecl_override: Option<usize>,
    /// EBCDIC code page used for labels, names and text payloads.
    pub encoding: String,
    /// Strip the rightmost 8-column sequence number from fixed-80 text.
    pub unnum: bool,
    /// Treat every stream as text.
    pub force_text: bool,
    /// Treat every stream as binary.
    pub binary_only: bool,
    /// Stamp extracted files with the ISPF modified date.
    pub preserve_modify_date: bool,
    /// Refuse to materialize any single record above this size.
    pub max_record_bytes: usize,
    /// Maximum container nesting depth.
    pub max_nested: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lrecl_override: None,
            encoding: "cp1140".to_string(),
            unnum: true,
            force_text: false,
            binary_only: false,
            preserve_modify_date: false,
            max_record_bytes: 64 << 20,
            max_nested: 8,
        }
    }
}

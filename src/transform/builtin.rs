//! Built-in transform modules.
//!
//! Protocol decoders live outside the relay; these are the generic stages
//! every deployment gets: two observers and three content rewriters.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::TransformError;
use crate::transform::{MessageContext, ModuleRegistry, Transform};

const DEFAULT_PREVIEW_BYTES: usize = 256;

pub(crate) fn register_all(registry: &mut ModuleRegistry) {
    registry.register("display", Display::DESCRIPTION, |options| {
        Ok(Arc::new(Display::from_options(options)?) as Arc<dyn Transform>)
    });
    registry.register("hexdump", HexDump::DESCRIPTION, |options| {
        Ok(Arc::new(HexDump::from_options(options)?) as Arc<dyn Transform>)
    });
    registry.register("uppercase", Uppercase::DESCRIPTION, |_| {
        Ok(Arc::new(Uppercase) as Arc<dyn Transform>)
    });
    registry.register("lowercase", Lowercase::DESCRIPTION, |_| {
        Ok(Arc::new(Lowercase) as Arc<dyn Transform>)
    });
    registry.register("replace", Replace::DESCRIPTION, |options| {
        Ok(Arc::new(Replace::from_options(options)?) as Arc<dyn Transform>)
    });
}

/// Render bytes as printable ASCII with escapes.
pub fn escape_bytes(data: &[u8]) -> String {
    data.escape_ascii().to_string()
}

/// Classic offset / hex / ASCII dump, 16 bytes per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

fn preview_limit(module: &str, options: &toml::Table) -> Result<usize, TransformError> {
    match options.get("max_bytes") {
        None => Ok(DEFAULT_PREVIEW_BYTES),
        Some(value) => value
            .as_integer()
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .ok_or_else(|| TransformError::Options {
                module: module.to_string(),
                reason: "'max_bytes' must be a positive integer".into(),
            }),
    }
}

fn string_option<'a>(
    module: &str,
    options: &'a toml::Table,
    key: &str,
) -> Result<Option<&'a str>, TransformError> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => value.as_str().map(Some).ok_or_else(|| TransformError::Options {
            module: module.to_string(),
            reason: format!("'{}' must be a string", key),
        }),
    }
}

/// Prints a text preview of every chunk. Bytes pass through unchanged.
#[derive(Debug, Clone)]
pub struct Display {
    max_bytes: usize,
}

impl Display {
    const DESCRIPTION: &'static str = "Display chunk contents as escaped text";

    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    fn from_options(options: &toml::Table) -> Result<Self, TransformError> {
        Ok(Self::new(preview_limit("display", options)?))
    }
}

impl Transform for Display {
    fn name(&self) -> &str {
        "display"
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn process(&self, ctx: &MessageContext, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let shown = &data[..data.len().min(self.max_bytes)];
        tracing::info!(
            target: "intercept_relay::display",
            direction = ctx.direction.label(),
            message_number = ctx.message_number,
            from = %ctx.source,
            to = %ctx.destination,
            len = data.len(),
            truncated = shown.len() < data.len(),
            "{}",
            escape_bytes(shown)
        );
        Ok(data.to_vec())
    }
}

/// Prints a hex dump of every chunk. Bytes pass through unchanged.
#[derive(Debug, Clone)]
pub struct HexDump {
    max_bytes: usize,
}

impl HexDump {
    const DESCRIPTION: &'static str = "Display chunk contents as a hex dump";

    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    fn from_options(options: &toml::Table) -> Result<Self, TransformError> {
        Ok(Self::new(preview_limit("hexdump", options)?))
    }
}

impl Transform for HexDump {
    fn name(&self) -> &str {
        "hexdump"
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn process(&self, ctx: &MessageContext, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let shown = &data[..data.len().min(self.max_bytes)];
        tracing::info!(
            target: "intercept_relay::display",
            direction = ctx.direction.label(),
            message_number = ctx.message_number,
            from = %ctx.source,
            to = %ctx.destination,
            len = data.len(),
            "\n{}",
            hex_dump(shown)
        );
        Ok(data.to_vec())
    }
}

/// ASCII upper-casing. Non-ASCII bytes are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uppercase;

impl Uppercase {
    const DESCRIPTION: &'static str = "Convert ASCII letters to upper case";
}

impl Transform for Uppercase {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn process(&self, _ctx: &MessageContext, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(data.to_ascii_uppercase())
    }
}

/// ASCII lower-casing. Non-ASCII bytes are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lowercase;

impl Lowercase {
    const DESCRIPTION: &'static str = "Convert ASCII letters to lower case";
}

impl Transform for Lowercase {
    fn name(&self) -> &str {
        "lowercase"
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn process(&self, _ctx: &MessageContext, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(data.to_ascii_lowercase())
    }
}

/// Replaces every occurrence of a byte string within a chunk.
///
/// Matches spanning two chunks are not seen; chunks are read boundaries, not
/// message boundaries.
#[derive(Debug, Clone)]
pub struct Replace {
    find: Vec<u8>,
    replace: Vec<u8>,
}

impl Replace {
    const DESCRIPTION: &'static str = "Replace a byte string within each chunk";

    pub fn new(find: impl Into<Vec<u8>>, replace: impl Into<Vec<u8>>) -> Result<Self, TransformError> {
        let find = find.into();
        if find.is_empty() {
            return Err(TransformError::Options {
                module: "replace".into(),
                reason: "'find' must not be empty".into(),
            });
        }
        Ok(Self {
            find,
            replace: replace.into(),
        })
    }

    fn from_options(options: &toml::Table) -> Result<Self, TransformError> {
        let find = string_option("replace", options, "find")?.ok_or_else(|| TransformError::Options {
            module: "replace".into(),
            reason: "missing 'find'".into(),
        })?;
        let replace = string_option("replace", options, "replace")?.unwrap_or_default();
        Self::new(find.as_bytes(), replace.as_bytes())
    }
}

impl Transform for Replace {
    fn name(&self) -> &str {
        "replace"
    }

    fn description(&self) -> &str {
        Self::DESCRIPTION
    }

    fn process(&self, _ctx: &MessageContext, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut out = Vec::with_capacity(data.len());
        let mut rest = data;
        while let Some(pos) = rest.windows(self.find.len()).position(|w| w == self.find.as_slice()) {
            out.extend_from_slice(&rest[..pos]);
            out.extend_from_slice(&self.replace);
            rest = &rest[pos + self.find.len()..];
        }
        out.extend_from_slice(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::transform::Direction;

    fn ctx() -> MessageContext {
        MessageContext::new(
            7,
            Direction::ClientToRemote,
            "192.168.1.10:50123".parse().unwrap(),
            "10.0.0.5:389".parse().unwrap(),
        )
    }

    #[test]
    fn observers_do_not_change_bytes() {
        let data = b"\x30\x0c\x02\x01\x01\x60\x07bind".to_vec();
        assert_eq!(Display::new(4).process(&ctx(), &data).unwrap(), data);
        assert_eq!(HexDump::new(64).process(&ctx(), &data).unwrap(), data);
    }

    #[test]
    fn case_transforms_touch_ascii_only() {
        let data = "naïve User".as_bytes();
        let upper = Uppercase.process(&ctx(), data).unwrap();
        assert_eq!(upper, "NAïVE USER".as_bytes());
        assert_eq!(Lowercase.process(&ctx(), &upper).unwrap(), "naïve user".as_bytes());
    }

    #[test]
    fn replace_changes_length() {
        let stage = Replace::new("pass=secret", "pass=x").unwrap();
        let out = stage
            .process(&ctx(), b"user=a&pass=secret&again pass=secret")
            .unwrap();
        assert_eq!(out, b"user=a&pass=x&again pass=x");

        let untouched = stage.process(&ctx(), b"no match here").unwrap();
        assert_eq!(untouched, b"no match here");
    }

    #[test]
    fn replace_requires_find() {
        let registry = ModuleRegistry::with_builtins();
        let err = registry.build(&StageConfig::new("replace")).unwrap_err();
        assert!(err.to_string().contains("missing 'find'"));

        assert!(Replace::new("", "x").is_err());
    }

    #[test]
    fn preview_limit_is_validated() {
        let mut stage = StageConfig::new("display");
        stage.options.insert("max_bytes".into(), toml::Value::Integer(0));
        let err = ModuleRegistry::with_builtins().build(&stage).unwrap_err();
        assert!(matches!(err, TransformError::Options { .. }));
    }

    #[test]
    fn hex_dump_layout() {
        let dump = hex_dump(b"GET / HTTP/1.1\r\nHost");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  47 45 54 20"));
        assert!(lines[0].ends_with("|GET / HTTP/1.1..|"));
        assert!(lines[1].starts_with("00000010  48 6f 73 74"));
        assert!(lines[1].ends_with("|Host|"));
    }

    #[test]
    fn escaping_is_printable() {
        assert_eq!(escape_bytes(b"a\r\n\x00"), "a\\r\\n\\x00");
    }
}

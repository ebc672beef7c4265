//! Packed argument-string codec.
//!
//! Arguments travel between parent and child as a colon-separated list of
//! `key` or `key=value` tokens so that the real argv stays untouched. A
//! colon inside a value is escaped as a tab on the wire. Duplicate keys are
//! legal (as they would be in argv) and addressed by ordinal index on
//! lookup. Empty values are legal.

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("second '=' inside a single token")]
    DoubleAssign,
    #[error("tab character is reserved as the colon escape")]
    LiteralTab,
}

/// One parsed `key` or `key=value` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub key: String,
    pub value: Option<String>,
}

/// An ordered argument list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgList {
    entries: Vec<Arg>,
}

fn unescape(s: &str) -> String {
    s.replace('\t', ":")
}

fn escape(s: &str) -> String {
    s.replace(':', "\t")
}

impl ArgList {
    /// Parse a packed string. The empty string parses to one empty key,
    /// matching the wire format's "always at least one token" rule.
    pub fn unpack(packed: &str) -> Result<Self, ArgError> {
        let mut entries = Vec::new();
        for token in packed.split(':') {
            let mut it = token.splitn(2, '=');
            let key = it.next().unwrap_or("");
            let value = it.next();
            if let Some(v) = value {
                if v.contains('=') {
                    return Err(ArgError::DoubleAssign);
                }
                entries.push(Arg {
                    key: unescape(key),
                    value: Some(unescape(v)),
                });
            } else {
                entries.push(Arg {
                    key: unescape(key),
                    value: None,
                });
            }
        }
        Ok(Self { entries })
    }

    /// Serialise back to wire form.
    pub fn pack(&self) -> String {
        self.to_string()
    }

    /// Return the value of the `ind`-th occurrence of `key`. A present key
    /// without a value yields `Some(None)`.
    pub fn lookup(&self, key: &str, mut ind: usize) -> Option<Option<&str>> {
        for e in &self.entries {
            if e.key == key {
                if ind == 0 {
                    return Some(e.value.as_deref());
                }
                ind -= 1;
            }
        }
        None
    }

    /// Shorthand for the first value of `key`.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.lookup(key, 0).flatten()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key, 0).is_some()
    }

    pub fn push(&mut self, key: &str, value: Option<&str>) -> Result<(), ArgError> {
        if key.contains('\t') || value.is_some_and(|v| v.contains('\t')) {
            return Err(ArgError::LiteralTab);
        }
        self.entries.push(Arg {
            key: key.to_string(),
            value: value.map(str::to_string),
        });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arg> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ArgList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            f.write_str(&escape(&e.key))?;
            if let Some(v) = &e.value {
                write!(f, "={}", escape(v))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tokens() {
        let args = ArgList::unpack("width=640:fullscreen:height=480").unwrap();
        assert_eq!(args.value_of("width"), Some("640"));
        assert_eq!(args.value_of("height"), Some("480"));
        assert_eq!(args.lookup("fullscreen", 0), Some(None));
        assert_eq!(args.lookup("missing", 0), None);
    }

    #[test]
    fn duplicate_keys_by_ordinal() {
        let args = ArgList::unpack("file=a:file=b:file").unwrap();
        assert_eq!(args.lookup("file", 0), Some(Some("a")));
        assert_eq!(args.lookup("file", 1), Some(Some("b")));
        assert_eq!(args.lookup("file", 2), Some(None));
        assert_eq!(args.lookup("file", 3), None);
    }

    #[test]
    fn escaped_colon_round_trips() {
        let args = ArgList::unpack("path=/tmp\tsock:mode=ro").unwrap();
        assert_eq!(args.value_of("path"), Some("/tmp:sock"));
        assert_eq!(args.pack(), "path=/tmp\tsock:mode=ro");
    }

    #[test]
    fn empty_values_are_legal() {
        let args = ArgList::unpack("key=:other").unwrap();
        assert_eq!(args.lookup("key", 0), Some(Some("")));
        assert_eq!(args.pack(), "key=:other");
    }

    #[test]
    fn pack_unpack_identity() {
        for s in ["a=1:b:c=x\ty:d=", "solo", "k=v"] {
            let args = ArgList::unpack(s).unwrap();
            assert_eq!(args.pack(), s, "round trip of {:?}", s);
        }
    }

    #[test]
    fn double_assign_is_rejected() {
        assert_eq!(ArgList::unpack("a=b=c"), Err(ArgError::DoubleAssign));
    }

    #[test]
    fn push_refuses_literal_tab() {
        let mut args = ArgList::default();
        assert_eq!(args.push("k\t", None), Err(ArgError::LiteralTab));
        args.push("key", Some("v:1")).unwrap();
        assert_eq!(args.pack(), "key=v\t1");
        assert_eq!(
            ArgList::unpack(&args.pack()).unwrap().value_of("key"),
            Some("v:1")
        );
    }
}

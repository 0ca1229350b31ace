use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::rom::{OutOfBounds, Rom};
use crate::{EvermizerError, Result};

/// Symbol name to absolute image address.
pub type SymbolTable = BTreeMap<String, usize>;

/// One compiled edit instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    Write {
        addr: usize,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
    WriteSymbol {
        symbol: String,
        #[serde(default)]
        offset: usize,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
    Fill {
        addr: usize,
        len: usize,
        value: u8,
    },
    Copy {
        from: usize,
        to: usize,
        len: usize,
    },
    /// Writes `bytes` only when the image currently holds `expect` at `addr`.
    WriteIf {
        addr: usize,
        #[serde(with = "hex_bytes")]
        expect: Vec<u8>,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
}

/// A named, ordered list of edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPatch {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    pub ops: Vec<ScriptOp>,
}

// Op with symbols resolved to absolute addresses.
enum Resolved<'a> {
    Write { addr: usize, bytes: &'a [u8] },
    Fill { addr: usize, len: usize, value: u8 },
    Copy { from: usize, to: usize, len: usize },
    WriteIf { addr: usize, expect: &'a [u8], bytes: &'a [u8] },
}

impl<'a> Resolved<'a> {
    fn check(&self, rom: &Rom) -> std::result::Result<(), OutOfBounds> {
        match *self {
            Resolved::Write { addr, bytes } => rom.check_range(addr, bytes.len()),
            Resolved::Fill { addr, len, .. } => rom.check_range(addr, len),
            Resolved::Copy { from, to, len } => {
                rom.check_range(from, len)?;
                rom.check_range(to, len)
            }
            Resolved::WriteIf {
                addr,
                expect,
                bytes,
            } => {
                rom.check_range(addr, expect.len())?;
                rom.check_range(addr, bytes.len())
            }
        }
    }

    // Returns false when a conditional write was skipped.
    fn run(&self, rom: &mut Rom) -> std::result::Result<bool, OutOfBounds> {
        match *self {
            Resolved::Write { addr, bytes } => rom.write_n(addr, bytes)?,
            Resolved::Fill { addr, len, value } => rom.fill(addr, len, value)?,
            Resolved::Copy { from, to, len } => rom.copy_within(from, to, len)?,
            Resolved::WriteIf {
                addr,
                expect,
                bytes,
            } => {
                if rom.read_n(addr, expect.len())? != expect {
                    return Ok(false);
                }
                rom.write_n(addr, bytes)?;
            }
        }
        Ok(true)
    }
}

impl ScriptOp {
    fn resolve<'a>(&'a self, script: &str, symbols: &SymbolTable) -> Result<Resolved<'a>> {
        Ok(match self {
            ScriptOp::Write { addr, bytes } => Resolved::Write {
                addr: *addr,
                bytes,
            },
            ScriptOp::WriteSymbol {
                symbol,
                offset,
                bytes,
            } => {
                let base = symbols.get(symbol).ok_or_else(|| EvermizerError::ScriptReference {
                    script: script.to_string(),
                    symbol: symbol.clone(),
                })?;
                Resolved::Write {
                    addr: base.saturating_add(*offset),
                    bytes,
                }
            }
            ScriptOp::Fill { addr, len, value } => Resolved::Fill {
                addr: *addr,
                len: *len,
                value: *value,
            },
            ScriptOp::Copy { from, to, len } => Resolved::Copy {
                from: *from,
                to: *to,
                len: *len,
            },
            ScriptOp::WriteIf {
                addr,
                expect,
                bytes,
            } => Resolved::WriteIf {
                addr: *addr,
                expect,
                bytes,
            },
        })
    }
}

impl ScriptPatch {
    pub fn new(name: impl Into<String>) -> Self {
        ScriptPatch {
            name: name.into(),
            optional: false,
            ops: Vec::new(),
        }
    }

    fn resolve<'a>(&'a self, rom: &Rom, symbols: &SymbolTable) -> Result<Vec<Resolved<'a>>> {
        let mut resolved = Vec::with_capacity(self.ops.len());
        for (idx, op) in self.ops.iter().enumerate() {
            let op = op.resolve(&self.name, symbols)?;
            op.check(rom).map_err(|source| EvermizerError::ScriptRange {
                script: self.name.clone(),
                op: idx,
                source,
            })?;
            resolved.push(op);
        }
        Ok(resolved)
    }

    pub fn apply(&self, rom: &mut Rom, symbols: &SymbolTable) -> Result<()> {
        apply_scripts(rom, [self], symbols).map(|_| ())
    }
}

/// Replays `scripts` in order, each op in declared order.
///
/// Every script is resolved and range-checked before the first write, so an
/// error leaves `rom` untouched. Returns the number of ops that wrote.
pub fn apply_scripts<'a, I>(rom: &mut Rom, scripts: I, symbols: &SymbolTable) -> Result<usize>
where
    I: IntoIterator<Item = &'a ScriptPatch>,
{
    let mut plan = Vec::new();
    for script in scripts {
        plan.push((script, script.resolve(rom, symbols)?));
    }

    let mut written = 0usize;
    for (script, ops) in &plan {
        for (idx, op) in ops.iter().enumerate() {
            let wrote = op.run(rom).map_err(|source| EvermizerError::ScriptRange {
                script: script.name.clone(),
                op: idx,
                source,
            })?;
            if wrote {
                written += 1;
            } else {
                debug!("script {} op {}: condition not met, skipped", script.name, idx);
            }
        }
        info!("applied script {} ({} ops)", script.name, ops.len());
    }
    Ok(written)
}

/// Mandatory scripts plus the optional ones named in `enabled`, in table order.
pub fn select<'a>(
    scripts: &'a [ScriptPatch],
    enabled: &'a BTreeSet<String>,
) -> impl Iterator<Item = &'a ScriptPatch> + 'a {
    scripts
        .iter()
        .filter(move |s| !s.optional || enabled.contains(&s.name))
}

/// Serde helper for byte strings written as hex, e.g. `"22 00 00 EE"`.
pub(crate) mod hex_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let text: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        s.serialize_str(&text.join(" "))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        decode(&text).map_err(D::Error::custom)
    }

    /// Whitespace separates tokens; each token is an even run of hex digits,
    /// so `"0102"` and `"01 02"` agree while `"1 2"` is rejected.
    pub fn decode(text: &str) -> Result<Vec<u8>, String> {
        let mut out = Vec::new();
        for token in text.split_whitespace() {
            if token.len() % 2 != 0 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(format!("invalid hex token '{token}'"));
            }
            for pair in token.as_bytes().chunks(2) {
                let hi = hex_digit(pair[0]);
                let lo = hex_digit(pair[1]);
                out.push(hi << 4 | lo);
            }
        }
        Ok(out)
    }

    // Caller has checked `is_ascii_hexdigit`.
    fn hex_digit(b: u8) -> u8 {
        match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> SymbolTable {
        let mut s = SymbolTable::new();
        s.insert("table".to_string(), 0x20);
        s
    }

    fn script(name: &str, ops: Vec<ScriptOp>) -> ScriptPatch {
        ScriptPatch {
            name: name.to_string(),
            optional: false,
            ops,
        }
    }

    #[test]
    fn ops_run_in_declared_order() {
        let mut rom = Rom::new(vec![0; 0x40]);
        let s = script(
            "ordered",
            vec![
                ScriptOp::Fill {
                    addr: 0,
                    len: 4,
                    value: 0x11,
                },
                ScriptOp::Write {
                    addr: 1,
                    bytes: vec![0x22],
                },
                ScriptOp::WriteSymbol {
                    symbol: "table".to_string(),
                    offset: 2,
                    bytes: vec![0xAB, 0xCD],
                },
            ],
        );
        s.apply(&mut rom, &symbols()).unwrap();
        assert_eq!(&rom.data()[..4], &[0x11, 0x22, 0x11, 0x11]);
        assert_eq!(&rom.data()[0x22..0x24], &[0xAB, 0xCD]);
    }

    #[test]
    fn later_scripts_see_earlier_writes() {
        let mut rom = Rom::new(vec![0; 0x40]);
        let table = script(
            "table",
            vec![ScriptOp::Write {
                addr: 0x10,
                bytes: vec![1, 2, 3],
            }],
        );
        let consumer = script(
            "consumer",
            vec![
                ScriptOp::Copy {
                    from: 0x10,
                    to: 0x30,
                    len: 3,
                },
                ScriptOp::WriteIf {
                    addr: 0x30,
                    expect: vec![1, 2],
                    bytes: vec![9],
                },
            ],
        );
        let written = apply_scripts(&mut rom, [&table, &consumer], &symbols()).unwrap();
        assert_eq!(written, 3);
        assert_eq!(&rom.data()[0x30..0x33], &[9, 2, 3]);
    }

    #[test]
    fn unmet_condition_skips_write() {
        let mut rom = Rom::new(vec![0; 8]);
        let s = script(
            "cond",
            vec![ScriptOp::WriteIf {
                addr: 0,
                expect: vec![0xFF],
                bytes: vec![0x01],
            }],
        );
        assert_eq!(apply_scripts(&mut rom, [&s], &symbols()).unwrap(), 0);
        assert_eq!(rom.data()[0], 0);
    }

    #[test]
    fn unknown_symbol_is_reference_error() {
        let mut rom = Rom::new(vec![0; 8]);
        let s = script(
            "broken",
            vec![ScriptOp::WriteSymbol {
                symbol: "missing".to_string(),
                offset: 0,
                bytes: vec![1],
            }],
        );
        match s.apply(&mut rom, &symbols()).unwrap_err() {
            EvermizerError::ScriptReference { script, symbol } => {
                assert_eq!(script, "broken");
                assert_eq!(symbol, "missing");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn out_of_range_leaves_image_untouched() {
        let mut rom = Rom::new(vec![0; 0x10]);
        let good = script(
            "good",
            vec![ScriptOp::Fill {
                addr: 0,
                len: 0x10,
                value: 0xFF,
            }],
        );
        let bad = script(
            "bad",
            vec![
                ScriptOp::Write {
                    addr: 0,
                    bytes: vec![1],
                },
                ScriptOp::Copy {
                    from: 0,
                    to: 0x0C,
                    len: 8,
                },
            ],
        );
        let err = apply_scripts(&mut rom, [&good, &bad], &symbols()).unwrap_err();
        assert!(matches!(err, EvermizerError::ScriptRange { ref script, op: 1, .. } if script == "bad"));
        assert!(rom.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn select_keeps_table_order() {
        let mut a = script("a", vec![]);
        a.optional = true;
        let b = script("b", vec![]);
        let mut c = script("c", vec![]);
        c.optional = true;
        let scripts = vec![a, b, c];

        let enabled: BTreeSet<String> = ["c".to_string(), "a".to_string()].into_iter().collect();
        let names: Vec<&str> = select(&scripts, &enabled).map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let none = BTreeSet::new();
        let names: Vec<&str> = select(&scripts, &none).map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn compiled_table_deserializes() {
        let json = r#"{
            "name": "hooks",
            "optional": true,
            "ops": [
                {"op": "write", "addr": 16, "bytes": "22 00 00 EE"},
                {"op": "write_symbol", "symbol": "table", "bytes": "0102"},
                {"op": "write_if", "addr": 4, "expect": "A9 0C", "bytes": "EA EA"}
            ]
        }"#;
        let s: ScriptPatch = serde_json::from_str(json).unwrap();
        assert!(s.optional);
        assert_eq!(
            s.ops[0],
            ScriptOp::Write {
                addr: 16,
                bytes: vec![0x22, 0x00, 0x00, 0xEE]
            }
        );
        assert_eq!(
            s.ops[1],
            ScriptOp::WriteSymbol {
                symbol: "table".to_string(),
                offset: 0,
                bytes: vec![1, 2]
            }
        );
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(hex_bytes::decode("ABC").is_err());
        assert!(hex_bytes::decode("ZZ").is_err());
        assert_eq!(hex_bytes::decode(" 0a FF ").unwrap(), vec![0x0A, 0xFF]);
        assert_eq!(hex_bytes::decode("0102 ab").unwrap(), vec![0x01, 0x02, 0xAB]);
        assert!(hex_bytes::decode("").unwrap().is_empty());
    }

    #[test]
    fn hex_digits_do_not_pair_across_whitespace() {
        assert!(hex_bytes::decode("A B").is_err());
        assert!(hex_bytes::decode("+A").is_err());
        assert!(hex_bytes::decode("-1").is_err());
        assert!(hex_bytes::decode("0x1F").is_err());
    }
}

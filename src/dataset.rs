//! Parses the lattice/WFST text format (spec §6) into [`Lattice`]s, and
//! groups them into an ordered [`Dataset`].

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::label::Vocab;
use crate::lattice::{Lattice, RawArc};
use crate::pool::StringPool;

pub struct Dataset {
    pub lattices: Vec<Lattice>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.lattices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lattices.is_empty()
    }

    /// Parse `path` as a sequence of samples, each lattice carrying
    /// `multiplier` (reference = -1, hypothesis = +1, test = 0).
    pub fn load(
        path: &Path,
        multiplier: i8,
        src_vocab: &Vocab,
        tgt_vocab: &Vocab,
        pool: &StringPool,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut lines = BufReader::new(file).lines().enumerate().peekable();
        let mut lattices = Vec::new();

        while has_more_content(path, &mut lines)? {
            let sample = parse_sample(path, &mut lines, src_vocab, tgt_vocab, pool)?;
            lattices.push(Lattice::build(
                sample.arcs,
                sample.nstates,
                sample.final_state,
                multiplier,
            )?);
        }

        Ok(Self { lattices })
    }
}

struct RawSample {
    arcs: Vec<RawArc>,
    nstates: usize,
    final_state: u32,
}

type LineIter<'a> = std::iter::Peekable<
    std::iter::Enumerate<std::io::Lines<BufReader<File>>>,
>;

/// Skip blank/comment lines without consuming the next real content line,
/// reporting whether any content remains before EOF.
fn has_more_content(path: &Path, lines: &mut LineIter) -> Result<bool> {
    loop {
        match lines.peek() {
            None => return Ok(false),
            Some((_, Err(_))) => {
                let (_, bad) = lines.next().unwrap();
                bad.map_err(|source| Error::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            Some((_, Ok(text))) => {
                let trimmed = text.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    lines.next();
                    continue;
                }
                return Ok(true);
            }
        }
    }
}

fn next_meaningful_line(path: &Path, lines: &mut LineIter) -> Result<Option<(usize, String)>> {
    loop {
        match lines.next() {
            None => return Ok(None),
            Some((lineno, line)) => {
                let text = line.map_err(|source| Error::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                let trimmed = text.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                return Ok(Some((lineno + 1, text)));
            }
        }
    }
}

fn parse_sample(
    path: &Path,
    lines: &mut LineIter,
    src_vocab: &Vocab,
    tgt_vocab: &Vocab,
    pool: &StringPool,
) -> Result<RawSample> {
    // Per-sample bump allocator for state identifiers; "0" always maps to
    // state index 0 regardless of first-appearance order.
    let mut state_ids: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    state_ids.insert("0".to_string(), 0);
    let mut next_state_id: u32 = 1;

    let mut assign_state = |id: &str, next_state_id: &mut u32| -> u32 {
        if let Some(&existing) = state_ids.get(id) {
            return existing;
        }
        let assigned = *next_state_id;
        *next_state_id += 1;
        state_ids.insert(id.to_string(), assigned);
        assigned
    };

    let mut arcs = Vec::new();
    let mut final_state = None;

    loop {
        let Some((lineno, text)) = next_meaningful_line(path, lines)? else {
            return Err(Error::Format {
                path: path.to_path_buf(),
                line: 0,
                message: "unexpected end of file inside a sample".into(),
            });
        };
        let tokens: Vec<&str> = text.split_whitespace().collect();

        match tokens.len() {
            0 => unreachable!("blank lines are skipped by next_meaningful_line"),
            3 => {
                return Err(Error::Format {
                    path: path.to_path_buf(),
                    line: lineno,
                    message: "three-token lines are a syntax error".into(),
                });
            }
            1 if tokens[0] != "EOS" => {
                if final_state.is_some() {
                    return Err(Error::Format {
                        path: path.to_path_buf(),
                        line: lineno,
                        message: "duplicated final state".into(),
                    });
                }
                let idx = assign_state(tokens[0], &mut next_state_id);
                final_state = Some(idx);

                let Some((eos_line, eos_text)) = next_meaningful_line(path, lines)? else {
                    return Err(Error::Format {
                        path: path.to_path_buf(),
                        line: lineno,
                        message: "missing EOS after final state".into(),
                    });
                };
                if eos_text.trim() != "EOS" {
                    return Err(Error::Format {
                        path: path.to_path_buf(),
                        line: eos_line,
                        message: "expected EOS after the final state id".into(),
                    });
                }
                break;
            }
            n if n >= 4 => {
                let src = assign_state(tokens[0], &mut next_state_id);
                let dst = assign_state(tokens[1], &mut next_state_id);
                let ilbl = src_vocab.intern(tokens[2], pool);
                let olbl = tgt_vocab.intern(tokens[3], pool);
                let mut wgh = Vec::with_capacity(n - 4);
                for tok in &tokens[4..] {
                    let w: f64 = tok.parse().map_err(|_| Error::Format {
                        path: path.to_path_buf(),
                        line: lineno,
                        message: format!("invalid real weight {:?}", tok),
                    })?;
                    wgh.push(w);
                }
                arcs.push(RawArc { src, dst, ilbl, olbl, wgh });
            }
            _ => {
                return Err(Error::Format {
                    path: path.to_path_buf(),
                    line: lineno,
                    message: "wrong column count on arc line".into(),
                });
            }
        }
    }

    let final_state = final_state.ok_or_else(|| Error::Format {
        path: path.to_path_buf(),
        line: 0,
        message: "sample has no final state".into(),
    })?;

    Ok(RawSample {
        arcs,
        nstates: next_state_id as usize,
        final_state,
    })
}

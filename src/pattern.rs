//! Pattern compiler and per-arc / per-state-pair feature materialization.
//!
//! Patterns are compiled once from strings of the form
//! `[tag:][name:]item[,item]*`, each item `A S T[=A S T]`. Per the design
//! note on the pattern language, the compiled [`Pattern`] is a plain array
//! of item descriptors; nothing downstream of `compile` ever touches the
//! source string again.

use crate::error::{Error, Result};
use crate::label::{LabelId, Vocab};
use crate::pool::StringPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl Side {
    fn parse(c: char) -> Option<Self> {
        match c {
            's' => Some(Side::Source),
            't' => Some(Side::Target),
            _ => None,
        }
    }
}

/// One operand of an item: which arc (0 or 1), which side, which token.
#[derive(Debug, Clone, Copy)]
pub struct TokenRef {
    pub arc: u8,
    pub side: Side,
    pub token: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum Item {
    Single(TokenRef),
    Equality(TokenRef, TokenRef),
}

impl Item {
    fn references_arc1(&self) -> bool {
        match self {
            Item::Single(a) => a.arc == 1,
            Item::Equality(a, b) => a.arc == 1 || b.arc == 1,
        }
    }

    fn references_arc0(&self) -> bool {
        match self {
            Item::Single(a) => a.arc == 0,
            Item::Equality(a, b) => a.arc == 0 || b.arc == 0,
        }
    }

    fn renumber_arc1_to_arc0(&mut self) {
        match self {
            Item::Single(a) => a.arc = 0,
            Item::Equality(a, b) => {
                a.arc = 0;
                b.arc = 0;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Unigram,
    Bigram,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub tag: u8,
    pub name_hash: Option<u64>,
    pub kind: PatternKind,
    pub items: Vec<Item>,
}

impl Pattern {
    /// Compile one `[tag:][name:]item[,item]*` pattern string.
    pub fn compile(spec: &str, pool: &StringPool) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (tag, name, items_str) = match parts.len() {
            1 => (0u8, None, parts[0]),
            2 => {
                if let Ok(t) = parts[0].parse::<u8>() {
                    if t < 128 {
                        (t, None, parts[1])
                    } else {
                        return Err(Error::PatternSyntax(spec.into(), "tag must be 0..127".into()));
                    }
                } else {
                    (0u8, Some(parts[0].to_string()), parts[1])
                }
            }
            3 => {
                let t: u8 = parts[0]
                    .parse()
                    .map_err(|_| Error::PatternSyntax(spec.into(), "expected numeric tag".into()))?;
                if t >= 128 {
                    return Err(Error::PatternSyntax(spec.into(), "tag must be 0..127".into()));
                }
                (t, Some(parts[1].to_string()), parts[2])
            }
            _ => return Err(Error::PatternSyntax(spec.into(), "too many ':'-separated parts".into())),
        };

        let mut items = Vec::new();
        for item_str in items_str.split(',') {
            items.push(parse_item(spec, item_str)?);
        }
        if items.is_empty() {
            return Err(Error::PatternSyntax(spec.into(), "pattern has no items".into()));
        }

        let any_arc1 = items.iter().any(Item::references_arc1);
        let any_arc0 = items.iter().any(Item::references_arc0);
        let kind = if any_arc1 { PatternKind::Bigram } else { PatternKind::Unigram };

        let mut items = items;
        if kind == PatternKind::Bigram && !any_arc0 {
            // Every item references only arc 1: normalize down to arc 0,
            // demoting this pattern to unigram.
            for item in &mut items {
                item.renumber_arc1_to_arc0();
            }
            let name_hash = name.as_ref().map(|n| pool.intern_str(n, true));
            return Ok(Self { tag, name_hash, kind: PatternKind::Unigram, items });
        }

        let name_hash = name.as_ref().map(|n| pool.intern_str(n, true));
        Ok(Self { tag, name_hash, kind, items })
    }
}

fn parse_item(spec: &str, item_str: &str) -> Result<Item> {
    let halves: Vec<&str> = item_str.splitn(2, '=').collect();
    let first = parse_token_ref(spec, halves[0].trim())?;
    if halves.len() == 1 {
        return Ok(Item::Single(first));
    }
    let second = parse_token_ref(spec, halves[1].trim())?;
    Ok(Item::Equality(first, second))
}

fn parse_token_ref(spec: &str, s: &str) -> Result<TokenRef> {
    let toks: Vec<&str> = s.split_whitespace().collect();
    if toks.len() != 3 {
        return Err(Error::PatternSyntax(spec.into(), format!("malformed item {:?}", s)));
    }
    let arc: u8 = toks[0]
        .parse()
        .map_err(|_| Error::PatternSyntax(spec.into(), "arc index must be 0 or 1".into()))?;
    if arc > 1 {
        return Err(Error::PatternSyntax(spec.into(), "arc index must be 0 or 1".into()));
    }
    let side = Side::parse(toks[1].chars().next().unwrap_or(' '))
        .ok_or_else(|| Error::PatternSyntax(spec.into(), "side must be 's' or 't'".into()))?;
    let token: usize = toks[2]
        .parse()
        .map_err(|_| Error::PatternSyntax(spec.into(), "token index must be a non-negative integer".into()))?;
    Ok(TokenRef { arc, side, token })
}

/// Labels of up to two arcs, used when evaluating an item.
#[derive(Clone, Copy)]
pub struct ArcLabels {
    pub ilbl: LabelId,
    pub olbl: LabelId,
}

fn token_hash(arc_labels: &[ArcLabels], tref: TokenRef, src_vocab: &Vocab, tgt_vocab: &Vocab) -> u64 {
    let labels = arc_labels[tref.arc as usize];
    match tref.side {
        Side::Source => src_vocab.get(labels.ilbl).token(tref.token),
        Side::Target => tgt_vocab.get(labels.olbl).token(tref.token),
    }
}

fn eval_item(
    item: &Item,
    arc_labels: &[ArcLabels],
    src_vocab: &Vocab,
    tgt_vocab: &Vocab,
    pool: &StringPool,
) -> u64 {
    match item {
        Item::Single(t) => token_hash(arc_labels, *t, src_vocab, tgt_vocab),
        Item::Equality(a, b) => {
            let ha = token_hash(arc_labels, *a, src_vocab, tgt_vocab);
            let hb = token_hash(arc_labels, *b, src_vocab, tgt_vocab);
            let word = if ha == hb { "true" } else { "false" };
            pool.intern_str(word, true)
        }
    }
}

/// Evaluate `pattern` against the given arc label(s), returning the
/// content-hash input sequence (`name_hash` first, if any, then each
/// item's value hash) that the model turns into a feature key.
pub fn eval_pattern(
    pattern: &Pattern,
    arc_labels: &[ArcLabels],
    src_vocab: &Vocab,
    tgt_vocab: &Vocab,
    pool: &StringPool,
) -> Vec<u64> {
    let mut values = Vec::with_capacity(pattern.items.len() + 1);
    if let Some(nh) = pattern.name_hash {
        values.push(nh);
    }
    for item in &pattern.items {
        values.push(eval_item(item, arc_labels, src_vocab, tgt_vocab, pool));
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_bare_unigram() {
        let pool = StringPool::new(true);
        let p = Pattern::compile("0s0", &pool).unwrap();
        assert_eq!(p.kind, PatternKind::Unigram);
        assert_eq!(p.tag, 0);
        assert!(p.name_hash.is_none());
    }

    #[test]
    fn compiles_tagged_named_pattern() {
        let pool = StringPool::new(true);
        let p = Pattern::compile("3:mypat:0s0,0t1", &pool).unwrap();
        assert_eq!(p.tag, 3);
        assert!(p.name_hash.is_some());
        assert_eq!(p.items.len(), 2);
    }

    #[test]
    fn detects_bigram_from_arc1_reference() {
        let pool = StringPool::new(true);
        let p = Pattern::compile("0:b:0s0,1s0", &pool).unwrap();
        assert_eq!(p.kind, PatternKind::Bigram);
    }

    #[test]
    fn normalizes_all_arc1_bigram_to_unigram() {
        let pool = StringPool::new(true);
        let p = Pattern::compile("0:b:1s0,1t0", &pool).unwrap();
        assert_eq!(p.kind, PatternKind::Unigram);
        for item in &p.items {
            if let Item::Single(t) = item {
                assert_eq!(t.arc, 0);
            }
        }
    }

    #[test]
    fn equality_item_parses() {
        let pool = StringPool::new(true);
        let p = Pattern::compile("0:eq:0s0=0t0", &pool).unwrap();
        assert_eq!(p.items.len(), 1);
        assert!(matches!(p.items[0], Item::Equality(_, _)));
    }

    #[test]
    fn rejects_three_token_line_style_garbage() {
        let pool = StringPool::new(true);
        assert!(Pattern::compile("0:eq:0s", &pool).is_err());
    }

    #[test]
    fn equality_true_false_are_distinct_hashes() {
        let pool = StringPool::new(true);
        let p = Pattern::compile("0:eq:0s0=0t0", &pool).unwrap();
        let sv = Vocab::new();
        let tv = Vocab::new();
        let foo = sv.intern("foo", &pool);
        let foo_t = tv.intern("foo", &pool);
        let bar_t = tv.intern("bar", &pool);
        let labels_true = [ArcLabels { ilbl: foo, olbl: foo_t }];
        let labels_false = [ArcLabels { ilbl: foo, olbl: bar_t }];
        let vt = eval_pattern(&p, &labels_true, &sv, &tv, &pool);
        let vf = eval_pattern(&p, &labels_false, &sv, &tv, &pool);
        assert_ne!(vt, vf);
    }
}

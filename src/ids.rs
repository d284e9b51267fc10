//! # Global Id Codec
//!
//! Converts between local ids, global ids and `(shard, local id)` pairs.
//!
//! A global id is `shard_id * IDS_PER_SHARD + local_id` with the sign of the original value
//! applied to the whole composition. Anything below `IDS_PER_SHARD` in absolute value is a
//! local id on whichever shard is current.
//!
//! ```text
//!   shard 20, local 42   ->   200000000000042   ->   "20~42"
//!   shard 20, local -42  ->  -200000000000042   ->   "20~-42"
//! ```

use crate::error::{ShardError, ShardResult};
use crate::model::{Shard, ShardId};
use std::fmt;

/// Number of local ids reserved for each shard.
pub const IDS_PER_SHARD: i64 = 10_000_000_000_000;

/// Anything that carries an id: records loaded from a shard, shard-aware handles.
pub trait Identified {
    fn integral_id(&self) -> i64;
}

/// Resolves shard ids to shards; a miss is `Ok(None)`.
pub trait ShardResolver {
    fn resolve_shard(&self, id: ShardId) -> ShardResult<Option<Shard>>;
}

/// The id-ish inputs accepted by the codec.
#[derive(Clone, Copy)]
pub enum IdInput<'a> {
    Entity(&'a dyn Identified),
    Integer(i64),
    Text(&'a str),
}

impl fmt::Debug for IdInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdInput::Entity(entity) => write!(f, "Entity({})", entity.integral_id()),
            IdInput::Integer(id) => write!(f, "Integer({})", id),
            IdInput::Text(text) => write!(f, "Text({:?})", text),
        }
    }
}

impl From<i64> for IdInput<'_> {
    fn from(id: i64) -> Self {
        IdInput::Integer(id)
    }
}

impl<'a> From<&'a str> for IdInput<'a> {
    fn from(text: &'a str) -> Self {
        IdInput::Text(text)
    }
}

impl<'a> From<&'a String> for IdInput<'a> {
    fn from(text: &'a String) -> Self {
        IdInput::Text(text.as_str())
    }
}

impl<'a, T: Identified> From<&'a T> for IdInput<'a> {
    fn from(entity: &'a T) -> Self {
        IdInput::Entity(entity)
    }
}

/// A local id together with the shard that owns it.
///
/// `shard` is `None` when the id was already local, meaning "the caller's current shard".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalId {
    pub id: i64,
    pub shard: Option<Shard>,
}

/// Short display form of an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortId {
    /// Already local; rendered as the bare number
    Local(i64),
    /// `"<shard>~<local>"`
    Global { shard: ShardId, local: i64 },
    /// Global id whose shard could not be resolved; rendered unchanged
    Unresolved(i64),
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShortId::Local(id) | ShortId::Unresolved(id) => write!(f, "{}", id),
            ShortId::Global { shard, local } => write!(f, "{}~{}", shard, local),
        }
    }
}

/// Returns the integral id for any id-ish input.
///
/// Accepts entities, integers, decimal numerals (optionally signed) and the short form
/// `"<shard>~<local>"`, whose local part may carry the sign.
pub fn integral_id_for<'a>(value: impl Into<IdInput<'a>>) -> ShardResult<i64> {
    match value.into() {
        IdInput::Entity(entity) => Ok(entity.integral_id()),
        IdInput::Integer(id) => Ok(id),
        IdInput::Text(text) => parse_text(text),
    }
}

fn parse_text(text: &str) -> ShardResult<i64> {
    if let Some((shard, local)) = text.split_once('~') {
        let shard = parse_digits(shard).ok_or_else(|| ShardError::unparseable(text))?;
        let local = parse_signed(local).ok_or_else(|| ShardError::unparseable(text))?;
        let shard = ShardId::new(shard)?;
        return signed_id_operation(local, |abs| {
            (abs < IDS_PER_SHARD).then(|| shard.get() * IDS_PER_SHARD + abs)
        })
        .ok_or_else(|| ShardError::unparseable(text));
    }
    parse_signed(text).ok_or_else(|| ShardError::unparseable(text))
}

fn parse_digits(text: &str) -> Option<i64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn parse_signed(text: &str) -> Option<i64> {
    match text.strip_prefix('-') {
        Some(rest) => parse_digits(rest).map(|id| -id),
        None => parse_digits(text),
    }
}

/// Applies `f` to the absolute value of `id` and puts the original sign back on the result.
///
/// `f` must return a non-negative value. `None` from `f`, or an `id` without a
/// representable absolute value (`i64::MIN`), yields `None`.
pub fn signed_id_operation<F>(id: i64, f: F) -> Option<i64>
where
    F: FnOnce(i64) -> Option<i64>,
{
    let abs = id.checked_abs()?;
    let result = f(abs)?;
    debug_assert!(result >= 0, "signed_id_operation transform returned {result}");
    Some(if id < 0 { -result } else { result })
}

/// Splits an absolute global id into its raw shard number and local part.
fn split_global(abs: i64) -> (i64, i64) {
    (abs / IDS_PER_SHARD, abs % IDS_PER_SHARD)
}

/// Resolves any id to a local id and its owning shard.
///
/// Returns `Ok(None)` when the id names a shard that cannot be resolved, a data condition
/// rather than an error. Malformed input fails with [`ShardError::Unparseable`].
pub fn local_id_for<'a, R>(resolver: &R, value: impl Into<IdInput<'a>>) -> ShardResult<Option<LocalId>>
where
    R: ShardResolver + ?Sized,
{
    let input = value.into();
    let id = integral_id_for(input)?;
    let Some(abs) = id.checked_abs() else {
        return Err(ShardError::unparseable(id.to_string()));
    };
    if abs < IDS_PER_SHARD {
        return Ok(Some(LocalId { id, shard: None }));
    }
    let (raw_shard, local) = split_global(abs);
    let Ok(shard_id) = ShardId::new(raw_shard) else {
        return Ok(None);
    };
    let Some(shard) = resolver.resolve_shard(shard_id)? else {
        return Ok(None);
    };
    let local = if id < 0 { -local } else { local };
    Ok(Some(LocalId {
        id: local,
        shard: Some(shard),
    }))
}

/// Converts an id into the form meaningful on `target_shard`.
///
/// Ids owned by `target_shard` come back local; ids owned elsewhere come back global.
/// Local ids are taken to belong to `source_shard`. Ids naming an unknown shard are
/// returned unchanged.
pub fn relative_id_for<'a, R>(
    resolver: &R,
    value: impl Into<IdInput<'a>>,
    source_shard: &Shard,
    target_shard: &Shard,
) -> ShardResult<i64>
where
    R: ShardResolver + ?Sized,
{
    let input = value.into();
    let integral = integral_id_for(input)?;
    let Some(local) = local_id_for(resolver, integral)? else {
        return Ok(integral);
    };
    let owner = local.shard.as_ref().unwrap_or(source_shard);
    if owner == target_shard {
        Ok(local.id)
    } else {
        Ok(owner.global_id_for(local.id))
    }
}

/// Renders `"<shard>~<local>"` for global ids; local ids come back unchanged.
pub fn short_id_for<'a, R>(resolver: &R, value: impl Into<IdInput<'a>>) -> ShardResult<ShortId>
where
    R: ShardResolver + ?Sized,
{
    let integral = integral_id_for(value)?;
    match local_id_for(resolver, integral)? {
        None => Ok(ShortId::Unresolved(integral)),
        Some(LocalId { id, shard: None }) => Ok(ShortId::Local(id)),
        Some(LocalId {
            id,
            shard: Some(shard),
        }) => match shard.id() {
            Some(shard_id) => Ok(ShortId::Global {
                shard: shard_id,
                local: id,
            }),
            None => Ok(ShortId::Local(id)),
        },
    }
}

/// Inverse of [`local_id_for`]: composes a global id, taking local ids as belonging to
/// `source_shard`. Ids already global pass through. The sign is preserved.
pub fn global_id_for<'a>(value: impl Into<IdInput<'a>>, source_shard: &Shard) -> ShardResult<i64> {
    let id = integral_id_for(value)?;
    signed_id_operation(id, |abs| {
        if abs >= IDS_PER_SHARD {
            Some(abs)
        } else {
            Some(source_shard.global_id_for(abs))
        }
    })
    .ok_or_else(|| ShardError::unparseable(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseServerId;
    use hashbrown::HashMap;

    struct Fixed(HashMap<ShardId, Shard>);

    impl Fixed {
        fn with(ids: &[i64]) -> Self {
            Self(
                ids.iter()
                    .map(|&id| {
                        let id = ShardId::new(id).unwrap();
                        (id, Shard::new(id, None, Some(DatabaseServerId::new("db1")), false))
                    })
                    .collect(),
            )
        }

        fn shard(&self, id: i64) -> Shard {
            self.0[&ShardId::new(id).unwrap()].clone()
        }
    }

    impl ShardResolver for Fixed {
        fn resolve_shard(&self, id: ShardId) -> ShardResult<Option<Shard>> {
            Ok(self.0.get(&id).cloned())
        }
    }

    struct Account(i64);

    impl Identified for Account {
        fn integral_id(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn integral_id_accepts_every_shape() {
        assert_eq!(integral_id_for(17).unwrap(), 17);
        assert_eq!(integral_id_for("17").unwrap(), 17);
        assert_eq!(integral_id_for("-17").unwrap(), -17);
        assert_eq!(integral_id_for(&Account(99)).unwrap(), 99);
        assert_eq!(integral_id_for("20~42").unwrap(), 200_000_000_000_042);
        assert_eq!(integral_id_for("20~-42").unwrap(), -200_000_000_000_042);
    }

    #[test]
    fn integral_id_rejects_malformed_text() {
        for input in ["", "abc", "1.5", "~5", "5~", "1~2~3", "--4", "+4", "20~10000000000000"] {
            let err = integral_id_for(input).unwrap_err();
            assert!(
                matches!(err, ShardError::Unparseable { .. }),
                "{input:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn short_form_with_zero_shard_is_invalid() {
        assert_eq!(integral_id_for("0~5"), Err(ShardError::InvalidShardId(0)));
    }

    #[test]
    fn signed_operation_preserves_sign() {
        assert_eq!(signed_id_operation(-5, |abs| Some(abs * 10)), Some(-50));
        assert_eq!(signed_id_operation(5, |abs| Some(abs * 10)), Some(50));
        assert_eq!(signed_id_operation(0, |abs| Some(abs + 1)), Some(1));
        assert_eq!(signed_id_operation(i64::MIN, Some), None);
        assert_eq!(signed_id_operation(-3, |_| None), None);
    }

    #[test]
    fn concrete_encoding_on_shard_twenty() {
        let shards = Fixed::with(&[10, 20, 30]);
        let shard = shards.shard(20);
        let global = global_id_for(42, &shard).unwrap();
        assert_eq!(global, 200_000_000_000_042);
        let local = local_id_for(&shards, global).unwrap().unwrap();
        assert_eq!(local.id, 42);
        assert_eq!(local.shard, Some(shard));
    }

    #[test]
    fn local_ids_below_threshold_stay_local() {
        let shards = Fixed::with(&[10]);
        for id in [0, 1, 42, IDS_PER_SHARD - 1] {
            let local = local_id_for(&shards, id).unwrap().unwrap();
            assert_eq!(local, LocalId { id, shard: None });
        }
    }

    #[test]
    fn unknown_shard_is_soft() {
        let shards = Fixed::with(&[10]);
        assert_eq!(local_id_for(&shards, 40 * IDS_PER_SHARD + 1).unwrap(), None);
        assert_eq!(local_id_for(&shards, i64::MAX).unwrap(), None);
    }

    #[test]
    fn negative_global_ids_decompose_with_sign() {
        let shards = Fixed::with(&[10]);
        let local = local_id_for(&shards, -(10 * IDS_PER_SHARD + 5)).unwrap().unwrap();
        assert_eq!(local.id, -5);
        assert_eq!(local.shard, Some(shards.shard(10)));
        assert_eq!(global_id_for(-5, &shards.shard(10)).unwrap(), -(10 * IDS_PER_SHARD + 5));
    }

    #[test]
    fn global_ids_pass_through_global_id_for() {
        let shards = Fixed::with(&[10, 20]);
        let global = 20 * IDS_PER_SHARD + 3;
        assert_eq!(global_id_for(global, &shards.shard(10)).unwrap(), global);
        assert_eq!(global_id_for(7, &Shard::placeholder()).unwrap(), 7);
    }

    #[test]
    fn relative_id_depends_on_target() {
        let shards = Fixed::with(&[10, 20]);
        let (ten, twenty) = (shards.shard(10), shards.shard(20));
        let global = 20 * IDS_PER_SHARD + 8;

        assert_eq!(relative_id_for(&shards, global, &ten, &twenty).unwrap(), 8);
        assert_eq!(relative_id_for(&shards, global, &ten, &ten).unwrap(), global);
        assert_eq!(relative_id_for(&shards, 8, &twenty, &twenty).unwrap(), 8);
        assert_eq!(relative_id_for(&shards, 8, &twenty, &ten).unwrap(), global);

        let unknown = 55 * IDS_PER_SHARD + 1;
        assert_eq!(relative_id_for(&shards, unknown, &ten, &twenty).unwrap(), unknown);
    }

    #[test]
    fn short_ids_render_and_parse_back() {
        let shards = Fixed::with(&[20]);
        let global = global_id_for(42, &shards.shard(20)).unwrap();
        let short = short_id_for(&shards, global).unwrap();
        assert_eq!(short.to_string(), "20~42");
        assert_eq!(integral_id_for(short.to_string().as_str()).unwrap(), global);

        let negative = short_id_for(&shards, -global).unwrap();
        assert_eq!(negative.to_string(), "20~-42");
        assert_eq!(integral_id_for(negative.to_string().as_str()).unwrap(), -global);

        assert_eq!(short_id_for(&shards, 42).unwrap(), ShortId::Local(42));
        let unknown = 77 * IDS_PER_SHARD;
        assert_eq!(short_id_for(&shards, unknown).unwrap(), ShortId::Unresolved(unknown));
    }
}

//! Durable audit progress records.
//!
//! Progress lives in exactly one of two namespaces:
//! - per-server audits: keyed `(type, id, server, begin)`,
//! - everything else: keyed `(type, id, begin)`.
//!
//! A row maps the range `[begin, value.end)` to a [`RangePhase`]. Reading
//! progress over a requested range produces a complete tiling: persisted
//! pieces carry their recorded phase, gaps come back as
//! [`RangePhase::Invalid`].

use bytes::Bytes;
use lodestone_store::{keys, Result as StoreResult, Transaction};
use lodestone_types::{AuditId, AuditType, KeyRange, RangePhase, ServerId};
use serde::{Deserialize, Serialize};

/// Value stored under a progress row key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ProgressValue {
    end: Bytes,
    phase: RangePhase,
}

/// Persists one verified piece in the range-based namespace.
pub fn persist_range_progress(
    tx: &mut Transaction,
    audit_type: AuditType,
    id: AuditId,
    range: &KeyRange,
    phase: RangePhase,
) -> StoreResult<()> {
    tx.set_typed(
        keys::audit_progress_range_key(audit_type, id, &range.begin),
        &ProgressValue {
            end: range.end.clone(),
            phase,
        },
    )
}

/// Persists one verified piece in the server-based namespace.
pub fn persist_server_progress(
    tx: &mut Transaction,
    audit_type: AuditType,
    id: AuditId,
    server: ServerId,
    range: &KeyRange,
    phase: RangePhase,
) -> StoreResult<()> {
    tx.set_typed(
        keys::audit_progress_server_key(audit_type, id, server, &range.begin),
        &ProgressValue {
            end: range.end.clone(),
            phase,
        },
    )
}

/// Reads the range-based progress tiling of `request` for audit `(type, id)`.
pub fn read_range_progress(
    tx: &mut Transaction,
    audit_type: AuditType,
    id: AuditId,
    request: &KeyRange,
) -> StoreResult<Vec<(KeyRange, RangePhase)>> {
    let rows = tx.get_range(&keys::audit_progress_range_space(audit_type, id), usize::MAX)?;
    let mut pieces = Vec::with_capacity(rows.len());
    for (key, raw) in rows {
        let Some(begin) = keys::audit_progress_range_suffix(audit_type, id, &key) else {
            continue;
        };
        let value: ProgressValue = decode(&raw)?;
        pieces.push((
            KeyRange::new(Bytes::copy_from_slice(begin), value.end),
            value.phase,
        ));
    }
    Ok(tile(request, pieces))
}

/// Reads the server-based progress tiling of `request` for one server.
pub fn read_server_progress(
    tx: &mut Transaction,
    audit_type: AuditType,
    id: AuditId,
    server: ServerId,
    request: &KeyRange,
) -> StoreResult<Vec<(KeyRange, RangePhase)>> {
    let space = keys::audit_progress_server_key(audit_type, id, server, b"");
    let rows = tx.get_range(&keys::prefix_range(&space), usize::MAX)?;
    let prefix_len = space.len();
    let mut pieces = Vec::with_capacity(rows.len());
    for (key, raw) in rows {
        let begin = &key[prefix_len..];
        let value: ProgressValue = decode(&raw)?;
        pieces.push((
            KeyRange::new(Bytes::copy_from_slice(begin), value.end),
            value.phase,
        ));
    }
    Ok(tile(request, pieces))
}

/// Clears every progress row of audit `(type, id)`, in both namespaces.
pub fn clear_progress(tx: &mut Transaction, audit_type: AuditType, id: AuditId) {
    for space in keys::audit_progress_space(audit_type, id) {
        tx.clear_range(&space);
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> StoreResult<T> {
    postcard::from_bytes(raw).map_err(|e| lodestone_store::StoreError::Codec(e.to_string()))
}

/// Builds a gap-free tiling of `request` from recorded pieces, clipping
/// overlaps in key order and filling gaps with `Invalid`.
fn tile(request: &KeyRange, mut pieces: Vec<(KeyRange, RangePhase)>) -> Vec<(KeyRange, RangePhase)> {
    pieces.sort_by(|(a, _), (b, _)| a.begin.cmp(&b.begin));
    let mut out = Vec::new();
    let mut cursor = request.begin.clone();
    for (range, phase) in pieces {
        if range.end <= cursor || range.begin >= request.end {
            continue;
        }
        if range.begin > cursor {
            out.push((KeyRange::new(cursor.clone(), range.begin.clone()), RangePhase::Invalid));
            cursor = range.begin.clone();
        }
        let end = range.end.min(request.end.clone());
        if end > cursor {
            out.push((KeyRange::new(cursor.clone(), end.clone()), phase));
            cursor = end;
        }
    }
    if cursor < request.end {
        out.push((
            KeyRange::new(cursor, request.end.clone()),
            RangePhase::Invalid,
        ));
    }
    out
}

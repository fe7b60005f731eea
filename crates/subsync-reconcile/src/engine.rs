use std::collections::BTreeMap;

use crate::{
    Baseline, ClientConfigEntry, ClientTraffic, Group, GroupSync, GroupValues, ReconcileOutcome,
    SkipReason, SkippedGroup,
};

/// Group config entries by non-empty `subId`. Entries without one belong to
/// no group and are never touched. Output is ordered by `sub_id`.
pub fn derive_groups(entries: &[ClientConfigEntry]) -> Vec<Group> {
    let mut by_sub: BTreeMap<String, Vec<ClientConfigEntry>> = BTreeMap::new();
    for entry in entries {
        if let Some(sub_id) = entry.sub_id() {
            by_sub
                .entry(sub_id.to_string())
                .or_default()
                .push(entry.clone());
        }
    }
    by_sub
        .into_iter()
        .map(|(sub_id, entries)| Group { sub_id, entries })
        .collect()
}

/// Group expiry policy:
/// - any strictly positive value => the largest one (furthest deadline)
/// - else any strictly negative value => the one closest to zero
///   (nearest, most restrictive grace marker)
/// - else 0 (unlimited)
pub fn resolve_expiry<I>(values: I) -> i64
where
    I: IntoIterator<Item = i64>,
{
    let mut furthest_deadline: Option<i64> = None;
    let mut nearest_grace: Option<i64> = None;

    for v in values {
        if v > 0 {
            furthest_deadline = Some(furthest_deadline.map_or(v, |m| m.max(v)));
        } else if v < 0 {
            nearest_grace = Some(nearest_grace.map_or(v, |m| m.max(v)));
        }
    }

    furthest_deadline.or(nearest_grace).unwrap_or(0)
}

/// Per-group arithmetic, kept separate so the invariants can be tested
/// without building config entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupCalc {
    pub max_up: i64,
    pub max_down: i64,
    pub max_total: i64,
    pub expiry_time: i64,
    pub delta_up: i64,
    pub delta_down: i64,
}

impl GroupCalc {
    /// `rows` must be non-empty for the maxima to mean anything; an empty
    /// slice yields all zeros.
    pub fn compute(rows: &[&ClientTraffic], prior: &Baseline) -> Self {
        let max_up = rows.iter().map(|r| r.up).max().unwrap_or(0);
        let max_down = rows.iter().map(|r| r.down).max().unwrap_or(0);
        let max_total = rows.iter().map(|r| r.total).max().unwrap_or(0);
        let expiry_time = resolve_expiry(rows.iter().map(|r| r.expiry_time));

        // Only forward progress against our own snapshot counts. Unknown
        // emails and lowered counters (resets) contribute nothing.
        let mut delta_up: i64 = 0;
        let mut delta_down: i64 = 0;
        for row in rows {
            let Some(seen) = prior.get(&row.email) else {
                continue;
            };
            if row.up > seen.up {
                delta_up = delta_up.saturating_add(row.up.saturating_sub(seen.up));
            }
            if row.down > seen.down {
                delta_down = delta_down.saturating_add(row.down.saturating_sub(seen.down));
            }
        }

        Self {
            max_up,
            max_down,
            max_total,
            expiry_time,
            delta_up,
            delta_down,
        }
    }

    pub fn new_up(&self) -> i64 {
        self.max_up.saturating_add(self.delta_up)
    }

    pub fn new_down(&self) -> i64 {
        self.max_down.saturating_add(self.delta_down)
    }

    /// No member advanced since the snapshot: the group must not be written.
    pub fn is_unchanged(&self) -> bool {
        self.new_up() == self.max_up && self.new_down() == self.max_down
    }

    pub fn values(&self) -> GroupValues {
        GroupValues {
            up: self.new_up(),
            down: self.new_down(),
            total: self.max_total,
            expiry_time: self.expiry_time,
        }
    }
}

/// Deterministic reconciliation of every group against the prior snapshot.
///
/// - Group without traffic rows => skipped, reported
/// - Group without forward progress => unchanged, no writes
/// - Otherwise every traffic row and every config entry of the group is
///   rewritten with the same [`GroupValues`]
pub fn reconcile(
    current: &[ClientTraffic],
    groups: &[Group],
    prior: &Baseline,
) -> ReconcileOutcome {
    let mut out = ReconcileOutcome::default();

    for group in groups {
        let emails = group.emails();
        let rows: Vec<&ClientTraffic> = current
            .iter()
            .filter(|t| emails.contains(t.email.as_str()))
            .collect();

        if rows.is_empty() {
            out.skipped.push(SkippedGroup {
                sub_id: group.sub_id.clone(),
                reason: SkipReason::NoTrafficRows,
            });
            continue;
        }

        let calc = GroupCalc::compute(&rows, prior);
        if calc.is_unchanged() {
            out.unchanged.push(group.sub_id.clone());
            continue;
        }

        let values = calc.values();

        for row in &rows {
            let mut updated = (*row).clone();
            updated.apply(&values);
            updated.sub_id = Some(group.sub_id.clone());
            out.traffic_updates.push(updated);
        }

        for entry in &group.entries {
            let mut updated = entry.clone();
            updated.apply(&values);
            out.config_updates.push(updated);
        }

        out.synced.push(GroupSync {
            sub_id: group.sub_id.clone(),
            values,
            delta_up: calc.delta_up,
            delta_down: calc.delta_down,
            members: rows.len(),
        });
    }

    out
}

/// The traffic table as it looks after `updates` are written: every row in
/// `current`, with rows named in `updates` replaced. This is what the next
/// snapshot must record.
pub fn post_reconcile_rows(current: &[ClientTraffic], updates: &[ClientTraffic]) -> Vec<ClientTraffic> {
    let by_email: BTreeMap<&str, &ClientTraffic> =
        updates.iter().map(|u| (u.email.as_str(), u)).collect();

    current
        .iter()
        .map(|row| match by_email.get(row.email.as_str()) {
            Some(updated) => (*updated).clone(),
            None => row.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsageBaseline;

    fn prior(entries: &[(&str, i64, i64)]) -> Baseline {
        entries
            .iter()
            .map(|(e, up, down)| (e.to_string(), UsageBaseline { up: *up, down: *down }))
            .collect()
    }

    #[test]
    fn expiry_prefers_largest_positive() {
        assert_eq!(resolve_expiry([100, -5, 0]), 100);
        assert_eq!(resolve_expiry([7, 300, -1]), 300);
    }

    #[test]
    fn expiry_falls_back_to_nearest_negative() {
        assert_eq!(resolve_expiry([-5, -10]), -5);
        assert_eq!(resolve_expiry([0, -86_400_000, -172_800_000]), -86_400_000);
    }

    #[test]
    fn expiry_all_zero_is_unlimited() {
        assert_eq!(resolve_expiry([0, 0]), 0);
        assert_eq!(resolve_expiry(std::iter::empty()), 0);
    }

    #[test]
    fn calc_ignores_members_missing_from_snapshot() {
        let a = ClientTraffic::new("a", 500, 400);
        let calc = GroupCalc::compute(&[&a], &Baseline::new());
        assert_eq!(calc.delta_up, 0);
        assert_eq!(calc.delta_down, 0);
        assert!(calc.is_unchanged());
    }

    #[test]
    fn calc_reset_contributes_zero_not_negative() {
        let a = ClientTraffic::new("a", 10, 5);
        let b = ClientTraffic::new("b", 130, 60);
        let p = prior(&[("a", 100, 50), ("b", 100, 50)]);
        let calc = GroupCalc::compute(&[&a, &b], &p);
        assert_eq!(calc.delta_up, 30);
        assert_eq!(calc.delta_down, 10);
        assert_eq!(calc.new_up(), 160);
        assert_eq!(calc.new_down(), 70);
    }

    #[test]
    fn calc_saturates_instead_of_overflowing() {
        let a = ClientTraffic::new("a", i64::MAX, 0);
        let p = prior(&[("a", 0, 0)]);
        let calc = GroupCalc::compute(&[&a], &p);
        assert_eq!(calc.new_up(), i64::MAX);
    }

    #[test]
    fn post_reconcile_rows_replaces_by_email_and_keeps_order() {
        let current = vec![
            ClientTraffic::new("x", 1, 1),
            ClientTraffic::new("a", 2, 2),
            ClientTraffic::new("b", 3, 3),
        ];
        let updates = vec![ClientTraffic::new("b", 9, 9), ClientTraffic::new("a", 9, 9)];
        let rows = post_reconcile_rows(&current, &updates);
        let got: Vec<(&str, i64)> = rows.iter().map(|r| (r.email.as_str(), r.up)).collect();
        assert_eq!(got, vec![("x", 1), ("a", 9), ("b", 9)]);
    }
}

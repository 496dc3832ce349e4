//! Assignment engine.
//!
//! Pure function from a service snapshot to a placement and the move
//! actions realizing it. No clocks, no generated ids, no randomness: the
//! same input always produces the same output, which is what makes the
//! planner testable and replayable.

use shardman_core::{MoveAction, MoveActionList};
use std::collections::{BTreeMap, BTreeSet};

/// One declared shard as the engine sees it.
#[derive(Debug, Clone, Default)]
pub struct EngineShard {
    pub id: String,
    /// Balancing partition within the service.
    pub group: String,
    /// Desired task payload from the spec.
    pub task: String,
    /// Non-empty pins the shard; pinned shards are never auto-migrated.
    pub manual_container_id: String,
    /// Current placement from the spec ("" = unplaced).
    pub current_container: String,
    /// Whether the current owner asserts ownership through a shard
    /// heartbeat. A placed shard without an assertion is re-homed.
    pub asserted: bool,
    /// Whether the spec task changed since the shard was last planned; the
    /// owner must recycle the instance even if placement is unchanged.
    pub task_changed: bool,
}

/// Snapshot the engine plans against.
#[derive(Debug, Clone, Default)]
pub struct EngineInput {
    /// Live containers (heartbeat present).
    pub containers: BTreeSet<String>,
    /// Hard cap on shards per container; zero means unlimited.
    pub max_shard_count: usize,
    pub shards: Vec<EngineShard>,
    /// Shards a worker still asserts ownership of (heartbeat present) that
    /// are no longer declared, shard id → asserting container. The plan
    /// drops them.
    pub orphans: BTreeMap<String, String>,
}

/// The engine's verdict: the full new placement, the minimal move list
/// realizing it, and any shards no feasible container could take.
#[derive(Debug, Clone, Default)]
pub struct EnginePlan {
    /// shard id → container id; empty string means unassigned.
    pub placements: BTreeMap<String, String>,
    pub actions: MoveActionList,
    /// Shards left unassigned because no container has cap headroom.
    pub overflow: Vec<String>,
}

/// Per-group balancing state. Loads are group-local; the cap is enforced
/// against the service-wide totals.
struct GroupState {
    loads: BTreeMap<String, usize>,
    /// container → shards the balancing phase may move (not pinned).
    movable: BTreeMap<String, BTreeSet<String>>,
}

impl GroupState {
    fn new(containers: &BTreeSet<String>) -> Self {
        Self {
            loads: containers.iter().map(|c| (c.clone(), 0)).collect(),
            movable: BTreeMap::new(),
        }
    }

    fn assign(&mut self, totals: &mut BTreeMap<String, usize>, container: &str, movable: bool, shard_id: &str) {
        *self.loads.entry(container.to_string()).or_insert(0) += 1;
        *totals.entry(container.to_string()).or_insert(0) += 1;
        if movable {
            self.movable
                .entry(container.to_string())
                .or_default()
                .insert(shard_id.to_string());
        }
    }

    /// Container with the smallest group load that still has cap headroom;
    /// lexicographic id breaks ties. `None` when every container is full.
    fn least_loaded(&self, totals: &BTreeMap<String, usize>, cap: usize) -> Option<String> {
        let mut best: Option<(usize, &str)> = None;
        for (container, load) in &self.loads {
            if cap != 0 && totals.get(container).copied().unwrap_or(0) >= cap {
                continue;
            }
            if best.map_or(true, |(l, c)| (*load, container.as_str()) < (l, c)) {
                best = Some((*load, container));
            }
        }
        best.map(|(_, c)| c.to_string())
    }

    /// The most-loaded container that still has a movable shard;
    /// lexicographic id breaks ties.
    fn most_loaded_donor(&self) -> Option<(String, usize)> {
        let mut best: Option<(usize, &str)> = None;
        for (container, load) in &self.loads {
            if !self.movable.get(container).is_some_and(|s| !s.is_empty()) {
                continue;
            }
            if best.map_or(true, |(l, c)| {
                (*load, std::cmp::Reverse(container.as_str())) > (l, std::cmp::Reverse(c))
            }) {
                best = Some((*load, container));
            }
        }
        best.map(|(l, c)| (c.to_string(), l))
    }
}

/// Compute the new placement for one service.
///
/// Groups are balanced independently; the per-container cap counts shards
/// across the whole service. Within a group: honor pins, retain shards
/// already on live asserted owners, place free shards on the least-loaded
/// container (lexicographic tie-break), then move single shards off the
/// most-loaded container until the max−min gap is at most one. Shards
/// still asserted by a worker but no longer declared are dropped.
pub fn plan(service: &str, input: &EngineInput) -> EnginePlan {
    let mut placements: BTreeMap<String, String> = BTreeMap::new();
    let mut overflow: Vec<String> = Vec::new();
    // Service-wide shards per container, for the hard cap.
    let mut totals: BTreeMap<String, usize> =
        input.containers.iter().map(|c| (c.clone(), 0)).collect();

    let mut by_group: BTreeMap<&str, Vec<&EngineShard>> = BTreeMap::new();
    for shard in &input.shards {
        by_group.entry(shard.group.as_str()).or_default().push(shard);
    }

    for shards in by_group.values() {
        place_group(input, shards, &mut totals, &mut placements, &mut overflow);
    }

    let actions = emit_actions(service, input, &placements);
    EnginePlan {
        placements,
        actions,
        overflow,
    }
}

fn place_group(
    input: &EngineInput,
    shards: &[&EngineShard],
    totals: &mut BTreeMap<String, usize>,
    placements: &mut BTreeMap<String, String>,
    overflow: &mut Vec<String>,
) {
    let cap = input.max_shard_count;
    let live = &input.containers;
    let mut state = GroupState::new(live);

    // Pins first: an operator override is placed iff its target is alive
    // and is never auto-migrated, even past the cap.
    for shard in shards {
        if shard.manual_container_id.is_empty() {
            continue;
        }
        let pin = shard.manual_container_id.as_str();
        if live.contains(pin) {
            state.assign(totals, pin, false, &shard.id);
            placements.insert(shard.id.clone(), pin.to_string());
        } else {
            placements.insert(shard.id.clone(), String::new());
        }
    }

    // Stable retention: a live, asserted owner keeps its shard unless the
    // cap says otherwise.
    let mut free: Vec<&EngineShard> = Vec::new();
    for shard in shards {
        if !shard.manual_container_id.is_empty() {
            continue;
        }
        let owner = shard.current_container.as_str();
        let placed = !owner.is_empty() && live.contains(owner) && shard.asserted;
        if placed && (cap == 0 || totals.get(owner).copied().unwrap_or(0) < cap) {
            state.assign(totals, owner, true, &shard.id);
            placements.insert(shard.id.clone(), owner.to_string());
        } else {
            free.push(shard);
        }
    }

    // Free shards go to the least-loaded container, in id order.
    free.sort_by(|a, b| a.id.cmp(&b.id));
    for shard in free {
        match state.least_loaded(totals, cap) {
            Some(target) => {
                state.assign(totals, &target, true, &shard.id);
                placements.insert(shard.id.clone(), target);
            }
            None => {
                placements.insert(shard.id.clone(), String::new());
                overflow.push(shard.id.clone());
            }
        }
    }

    // Close the gap retention leaves behind: one shard at a time from the
    // fullest container to the emptiest until the spread is at most one.
    loop {
        let Some((donor, donor_load)) = state.most_loaded_donor() else {
            break;
        };
        let Some(recipient) = state.least_loaded(totals, cap) else {
            break;
        };
        let recipient_load = state.loads.get(&recipient).copied().unwrap_or(0);
        if donor == recipient || donor_load <= recipient_load + 1 {
            break;
        }

        let moved = state
            .movable
            .get(&donor)
            .and_then(|set| set.iter().next().cloned());
        let Some(shard_id) = moved else {
            break;
        };
        if let Some(set) = state.movable.get_mut(&donor) {
            set.remove(&shard_id);
        }
        *state.loads.get_mut(&donor).expect("donor is live") -= 1;
        *totals.get_mut(&donor).expect("donor is live") -= 1;
        state.assign(totals, &recipient, true, &shard_id);
        placements.insert(shard_id, recipient);
    }
}

/// Diff the new placement against the current one and emit the minimal move
/// list. Within one action the drop side precedes the add side, which is
/// the only ordering the plan guarantees.
fn emit_actions(
    service: &str,
    input: &EngineInput,
    placements: &BTreeMap<String, String>,
) -> MoveActionList {
    let mut actions = Vec::new();
    let mut shards: Vec<&EngineShard> = input.shards.iter().collect();
    shards.sort_by(|a, b| a.id.cmp(&b.id));

    for shard in shards {
        let new = placements
            .get(&shard.id)
            .map(String::as_str)
            .unwrap_or("");
        let old = shard.current_container.as_str();
        // A dead previous owner needs no explicit drop: it is gone by
        // definition and its heartbeats with it.
        let old_live = !old.is_empty() && input.containers.contains(old);

        let action = if new.is_empty() {
            old_live.then(|| MoveAction {
                service: service.to_string(),
                shard_id: shard.id.clone(),
                drop_endpoint: old.to_string(),
                ..Default::default()
            })
        } else if new == old {
            if shard.task_changed {
                // Recycle in place: drop then add on the same owner.
                Some(MoveAction {
                    service: service.to_string(),
                    shard_id: shard.id.clone(),
                    drop_endpoint: old.to_string(),
                    add_endpoint: new.to_string(),
                    task: shard.task.clone(),
                    allow_drop: false,
                })
            } else if !shard.asserted {
                // Owner never confirmed the placement; re-issue the add.
                Some(MoveAction {
                    service: service.to_string(),
                    shard_id: shard.id.clone(),
                    add_endpoint: new.to_string(),
                    task: shard.task.clone(),
                    ..Default::default()
                })
            } else {
                None
            }
        } else {
            Some(MoveAction {
                service: service.to_string(),
                shard_id: shard.id.clone(),
                drop_endpoint: if old_live { old.to_string() } else { String::new() },
                add_endpoint: new.to_string(),
                task: shard.task.clone(),
                allow_drop: false,
            })
        };

        if let Some(action) = action {
            actions.push(action);
        }
    }

    // Reap undeclared shards: the asserting owner is told to let go even
    // though the plan holds no placement for them.
    for (shard_id, owner) in &input.orphans {
        if owner.is_empty() || input.shards.iter().any(|s| &s.id == shard_id) {
            continue;
        }
        actions.push(MoveAction {
            service: service.to_string(),
            shard_id: shard_id.clone(),
            drop_endpoint: owner.clone(),
            ..Default::default()
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn containers(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn shard(id: &str, task: &str) -> EngineShard {
        EngineShard {
            id: id.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    fn placed(id: &str, task: &str, owner: &str) -> EngineShard {
        EngineShard {
            id: id.into(),
            task: task.into(),
            current_container: owner.into(),
            asserted: true,
            ..Default::default()
        }
    }

    fn owners(plan: &EnginePlan) -> Vec<(&str, &str)> {
        plan.placements
            .iter()
            .map(|(s, c)| (s.as_str(), c.as_str()))
            .collect()
    }

    #[test]
    fn cold_start_splits_with_lexicographic_tie_break() {
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![shard("s1", "t"), shard("s2", "t"), shard("s3", "t")],
            ..Default::default()
        };
        let plan = plan("svc", &input);

        // s1→c1, s2→c2, s3→c1: free shards in id order, least-loaded wins,
        // ties broken by container id.
        assert_eq!(
            owners(&plan),
            vec![("s1", "c1"), ("s2", "c2"), ("s3", "c1")]
        );
        assert_eq!(plan.actions.len(), 3);
        assert!(plan
            .actions
            .iter()
            .all(|a| a.drop_endpoint.is_empty() && !a.add_endpoint.is_empty()));
        assert!(plan.overflow.is_empty());
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let input = EngineInput {
            containers: containers(&["b", "a", "c"]),
            shards: (0..10).map(|i| shard(&format!("s{i}"), "t")).collect(),
            ..Default::default()
        };
        let p1 = plan("svc", &input);
        let p2 = plan("svc", &input);
        assert_eq!(p1.placements, p2.placements);
        assert_eq!(p1.actions, p2.actions);
    }

    #[test]
    fn stable_retention_keeps_existing_placements() {
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![
                placed("s1", "t", "c1"),
                placed("s2", "t", "c2"),
                placed("s3", "t", "c1"),
            ],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(
            owners(&plan),
            vec![("s1", "c1"), ("s2", "c2"), ("s3", "c1")]
        );
        // Converged snapshot: no moves at all.
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn dead_owner_rehomes_without_explicit_drop() {
        let input = EngineInput {
            containers: containers(&["c2"]),
            shards: vec![placed("s1", "t", "c1"), placed("s3", "t", "c1")],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(owners(&plan), vec![("s1", "c2"), ("s3", "c2")]);
        for action in &plan.actions {
            assert!(action.drop_endpoint.is_empty());
            assert_eq!(action.add_endpoint, "c2");
        }
    }

    #[test]
    fn returning_container_rebalances_toward_even() {
        // After a rolling restart everything sits on c2; when c1 comes back
        // the spread is reduced to at most one.
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![
                placed("s1", "t", "c2"),
                placed("s2", "t", "c2"),
                placed("s3", "t", "c2"),
            ],
            ..Default::default()
        };
        let plan = plan("svc", &input);

        let on_c1 = plan.placements.values().filter(|c| *c == "c1").count();
        let on_c2 = plan.placements.values().filter(|c| *c == "c2").count();
        assert_eq!(on_c1 + on_c2, 3);
        assert!(on_c1.abs_diff(on_c2) <= 1, "{on_c1}/{on_c2}");
        // Exactly one shard moved; its handover is a drop+add pair.
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].drop_endpoint, "c2");
        assert_eq!(plan.actions[0].add_endpoint, "c1");
    }

    #[test]
    fn task_change_recycles_in_place() {
        let mut s = placed("s1", "B", "c1");
        s.task_changed = true;
        let input = EngineInput {
            containers: containers(&["c1"]),
            shards: vec![s],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(plan.actions.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.drop_endpoint, "c1");
        assert_eq!(action.add_endpoint, "c1");
        assert_eq!(action.task, "B");
    }

    #[test]
    fn manual_pin_overrides_balance() {
        let mut pinned = shard("s2", "t");
        pinned.manual_container_id = "c2".into();
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![
                placed("s1", "t", "c1"),
                pinned,
                placed("s3", "t", "c1"),
            ],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(plan.placements["s2"], "c2");
    }

    #[test]
    fn pin_wins_capacity_over_retention() {
        // One slot on c1; the pin claims it even though s1 already sat
        // there, so retention frees s1 to the other container.
        let mut pinned = shard("s0", "t");
        pinned.manual_container_id = "c1".into();
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            max_shard_count: 1,
            shards: vec![placed("s1", "t", "c1"), pinned],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(plan.placements["s0"], "c1");
        assert_eq!(plan.placements["s1"], "c2");
        assert!(plan.overflow.is_empty());
    }

    #[test]
    fn pin_to_dead_container_leaves_shard_unassigned() {
        let mut pinned = placed("s1", "t", "c1");
        pinned.manual_container_id = "c9".into();
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![pinned],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(plan.placements["s1"], "");
        // The live previous owner is told to let go.
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].drop_endpoint, "c1");
        assert!(plan.actions[0].add_endpoint.is_empty());
        // Not an overflow: the pin, not capacity, keeps it unassigned.
        assert!(plan.overflow.is_empty());
    }

    #[test]
    fn removing_a_pin_restores_automatic_balance() {
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![placed("s1", "t", "c1"), placed("s2", "t", "c2")],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(owners(&plan), vec![("s1", "c1"), ("s2", "c2")]);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn max_shard_count_is_a_hard_cap() {
        let input = EngineInput {
            containers: containers(&["c1"]),
            max_shard_count: 2,
            shards: vec![shard("s1", "t"), shard("s2", "t"), shard("s3", "t")],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        let assigned = plan.placements.values().filter(|c| !c.is_empty()).count();
        assert_eq!(assigned, 2);
        assert_eq!(plan.overflow, vec!["s3".to_string()]);
    }

    #[test]
    fn cap_counts_across_groups() {
        let mk = |id: &str, group: &str| EngineShard {
            id: id.into(),
            group: group.into(),
            task: "t".into(),
            ..Default::default()
        };
        let input = EngineInput {
            containers: containers(&["c1"]),
            max_shard_count: 2,
            shards: vec![mk("s1", "g1"), mk("s2", "g2"), mk("s3", "g2")],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        let assigned = plan.placements.values().filter(|c| !c.is_empty()).count();
        assert_eq!(assigned, 2);
        assert_eq!(plan.overflow.len(), 1);
    }

    #[test]
    fn groups_balance_independently() {
        let mk = |id: &str, group: &str| EngineShard {
            id: id.into(),
            group: group.into(),
            task: "t".into(),
            ..Default::default()
        };
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![
                mk("a1", "g1"),
                mk("a2", "g1"),
                mk("b1", "g2"),
                mk("b2", "g2"),
            ],
            ..Default::default()
        };
        let plan = plan("svc", &input);

        for (group, prefix) in [("g1", "a"), ("g2", "b")] {
            let on_c1 = plan
                .placements
                .iter()
                .filter(|(s, c)| s.starts_with(prefix) && c.as_str() == "c1")
                .count();
            // Each group splits 1/1 on its own.
            assert_eq!(on_c1, 1, "group {group}");
        }
    }

    #[test]
    fn unasserted_placement_is_reissued() {
        // The spec says s1 runs on c1 but no heartbeat backs it up (e.g. a
        // rejected seed assignment): the planner re-issues the add.
        let mut s = placed("s1", "t", "c1");
        s.asserted = false;
        let input = EngineInput {
            containers: containers(&["c1"]),
            shards: vec![s],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert_eq!(plan.placements["s1"], "c1");
        assert_eq!(plan.actions.len(), 1);
        assert!(plan.actions[0].drop_endpoint.is_empty());
        assert_eq!(plan.actions[0].add_endpoint, "c1");
    }

    #[test]
    fn undeclared_shard_with_heartbeat_is_reaped() {
        // The spec for s9 was deleted while c1 still runs it and refreshes
        // its heartbeat: the plan drops it from its owner.
        let mut orphans = BTreeMap::new();
        orphans.insert("s9".to_string(), "c1".to_string());
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![placed("s1", "t", "c1")],
            orphans,
            ..Default::default()
        };
        let plan = plan("svc", &input);

        assert!(!plan.placements.contains_key("s9"));
        assert_eq!(plan.actions.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.shard_id, "s9");
        assert_eq!(action.drop_endpoint, "c1");
        assert!(action.add_endpoint.is_empty());
    }

    #[test]
    fn reap_is_deterministic_and_skips_declared_ids() {
        let mut orphans = BTreeMap::new();
        orphans.insert("s2".to_string(), "c2".to_string());
        orphans.insert("s1".to_string(), "c1".to_string());
        // A declared id never doubles as an orphan.
        orphans.insert("s0".to_string(), "c1".to_string());
        let input = EngineInput {
            containers: containers(&["c1", "c2"]),
            shards: vec![placed("s0", "t", "c1")],
            orphans,
            ..Default::default()
        };
        let plan = plan("svc", &input);

        let dropped: Vec<&str> = plan.actions.iter().map(|a| a.shard_id.as_str()).collect();
        assert_eq!(dropped, vec!["s1", "s2"]);
    }

    #[test]
    fn no_containers_means_everything_unassigned() {
        let input = EngineInput {
            containers: BTreeSet::new(),
            shards: vec![placed("s1", "t", "c1"), shard("s2", "t")],
            ..Default::default()
        };
        let plan = plan("svc", &input);
        assert!(plan.placements.values().all(String::is_empty));
        // The previous owner is dead, so there is nothing to drop and no
        // action to emit.
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn empty_input_is_a_noop() {
        let plan = plan("svc", &EngineInput::default());
        assert!(plan.placements.is_empty());
        assert!(plan.actions.is_empty());
        assert!(plan.overflow.is_empty());
    }
}

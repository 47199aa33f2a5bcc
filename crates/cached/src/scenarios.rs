//! Multi-node behavior over a simulated cluster
//!
//! Nodes are driven directly through the delegate traits so delivery order,
//! loss and churn are deterministic.

use crate::membership::GcTrigger;
use crate::node::{CacheNode, CreateOutcome, NodeSettings};
use crate::sync::MergePolicy;
use gossip_cache_core::types::*;
use gossip_cache_net::{Delegate, EventDelegate, MemberCount, NodeInfo};
use std::collections::HashMap;

const OVERHEAD: usize = 3;
const BUDGET: usize = 1400;
const MAX_ROUNDS: usize = 1000;
const FIRST_INCARNATION: u64 = 100;

struct SimNode {
    info: NodeInfo,
    node: CacheNode,
    members: MemberCount,
    alive: bool,
}

#[derive(Default)]
struct Sim {
    nodes: Vec<SimNode>,
}

impl Sim {
    fn with_nodes(names: &[&str]) -> Self {
        Self::with_settings(names, NodeSettings::default())
    }

    /// Nodes that already know each other
    fn with_settings(names: &[&str], settings: NodeSettings) -> Self {
        let mut sim = Sim::default();
        for name in names {
            sim.add(name, settings.clone());
        }
        for i in 0..sim.nodes.len() {
            for j in 0..sim.nodes.len() {
                if i != j {
                    let other = sim.nodes[j].info.clone();
                    sim.nodes[i].node.on_join(&other);
                }
            }
        }
        sim.refresh_counts();
        sim
    }

    /// A node alone in its own cluster
    fn add(&mut self, name: &str, settings: NodeSettings) {
        let members = MemberCount::new();
        let slot = self.nodes.len();
        let incarnation = FIRST_INCARNATION + slot as u64;
        self.nodes.push(SimNode {
            info: NodeInfo::with_incarnation(
                name,
                ([127, 0, 0, 1], 7000 + slot as u16).into(),
                incarnation,
            ),
            node: CacheNode::new(name, incarnation, settings, members.clone()),
            members,
            alive: true,
        });
    }

    fn index(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.info.name == name && n.alive)
            .unwrap()
    }

    fn incarnation(&self, name: &str) -> u64 {
        self.nodes[self.index(name)].info.incarnation
    }

    fn node(&self, name: &str) -> &CacheNode {
        &self.nodes[self.index(name)].node
    }

    fn live(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| self.nodes[i].alive).collect()
    }

    fn refresh_counts(&self) {
        let live = self.live().len();
        for i in self.live() {
            self.nodes[i].members.set(live);
        }
    }

    /// Join `name` through `seed` the way the cluster does it
    fn join(&mut self, name: &str, seed: &str) {
        let j = self.index(name);
        let s = self.index(seed);
        let joiner_info = self.nodes[j].info.clone();

        let joiner_state = self.nodes[j].node.snapshot_state(true).unwrap();
        self.nodes[s].node.on_join(&joiner_info);
        let seed_state = self.nodes[s].node.snapshot_state(true).unwrap();
        self.nodes[s].node.merge_state(&joiner_state, true).unwrap();
        self.nodes[j].node.merge_state(&seed_state, true).unwrap();

        for i in self.live() {
            if i != j {
                let info = self.nodes[i].info.clone();
                self.nodes[j].node.on_join(&info);
                if i != s {
                    self.nodes[i].node.on_join(&joiner_info);
                }
            }
        }
        self.refresh_counts();
    }

    fn leave(&mut self, name: &str) {
        let i = self.index(name);
        self.nodes[i].alive = false;
        let info = self.nodes[i].info.clone();
        for k in self.live() {
            self.nodes[k].node.on_leave(&info);
        }
        self.refresh_counts();
    }

    /// Bring back the last departed node called `name` in the same life,
    /// as after a failure that turned out to be a partition
    fn recover(&mut self, name: &str) {
        let i = self
            .nodes
            .iter()
            .rposition(|n| n.info.name == name && !n.alive)
            .unwrap();
        self.nodes[i].alive = true;
    }

    /// Replace a node with a fresh empty instance under a newer incarnation
    fn restart(&mut self, name: &str) {
        let i = self.index(name);
        let settings = self.nodes[i].node.settings().clone();
        let mut info = self.nodes[i].info.clone();
        info.incarnation += 1;
        self.nodes[i].info = info.clone();
        self.nodes[i].node = CacheNode::new(
            name,
            info.incarnation,
            settings,
            self.nodes[i].members.clone(),
        );
        for k in self.live() {
            if k != i {
                self.nodes[k].node.on_state_change(&info);
            }
        }
    }

    fn drain(&self, i: usize) -> Vec<Vec<u8>> {
        self.nodes[i].node.pending_outgoing_messages(OVERHEAD, BUDGET)
    }

    fn deliver(&self, to: usize, messages: &[Vec<u8>]) {
        for message in messages {
            self.nodes[to].node.handle_incoming_message(message).unwrap();
        }
    }

    /// Gossip until every queue is empty, each packet reaching every peer
    fn settle(&self) {
        self.settle_with(|sim, from| {
            sim.live().into_iter().filter(|&to| to != from).collect()
        });
    }

    /// Gossip until every queue is empty, each packet reaching only the next
    /// live node in the ring
    fn settle_ring(&self) {
        self.settle_with(|sim, from| {
            let live = sim.live();
            let pos = live.iter().position(|&i| i == from).unwrap();
            vec![live[(pos + 1) % live.len()]]
        });
    }

    fn settle_with(&self, targets: impl Fn(&Sim, usize) -> Vec<usize>) {
        for _ in 0..MAX_ROUNDS {
            let mut sent = false;
            for from in self.live() {
                let messages = self.drain(from);
                if messages.is_empty() {
                    continue;
                }
                sent = true;
                for to in targets(self, from) {
                    self.deliver(to, &messages);
                }
            }
            if !sent {
                return;
            }
        }
        panic!("gossip did not settle");
    }

    fn sorted_entries(&self, name: &str) -> Vec<CacheEntry> {
        let mut entries = self.node(name).entries();
        entries.sort_by_key(|e| e.id());
        entries
    }

    fn sorted_records(&self, name: &str) -> Vec<Record> {
        let mut records = self.node(name).list_records();
        records.sort_by_key(|r| r.id);
        records
    }
}

fn by_id(entries: Vec<CacheEntry>) -> HashMap<i64, CacheEntry> {
    entries.into_iter().map(|e| (e.id(), e)).collect()
}

#[test]
fn test_create_reaches_peer() {
    let sim = Sim::with_nodes(&["a", "b"]);

    assert_eq!(
        sim.node("a").create_record(Record::new(1, "x")).unwrap(),
        CreateOutcome::Created
    );
    sim.settle();

    assert_eq!(sim.sorted_records("b"), vec![Record::new(1, "x")]);
    assert_eq!(
        sim.sorted_entries("b"),
        vec![CacheEntry::new(
            Record::new(1, "x"),
            "a",
            sim.incarnation("a")
        )]
    );
}

#[test]
fn test_repeated_create_keeps_first_value() {
    let sim = Sim::with_nodes(&["a", "b"]);
    sim.node("a").create_record(Record::new(1, "x")).unwrap();
    sim.settle();

    assert_eq!(
        sim.node("a").create_record(Record::new(1, "y")).unwrap(),
        CreateOutcome::AlreadyExists
    );
    assert_eq!(
        sim.node("b").create_record(Record::new(1, "z")).unwrap(),
        CreateOutcome::AlreadyExists
    );
    sim.settle();

    assert_eq!(sim.sorted_records("a"), vec![Record::new(1, "x")]);
    assert_eq!(sim.sorted_records("b"), vec![Record::new(1, "x")]);
}

#[test]
fn test_departure_removes_exactly_its_records() {
    let mut sim = Sim::with_nodes(&["a", "b", "c"]);
    sim.node("a").create_record(Record::new(1, "from a")).unwrap();
    sim.node("b").create_record(Record::new(2, "from b")).unwrap();
    sim.node("c").create_record(Record::new(3, "from c")).unwrap();
    sim.node("c").create_record(Record::new(4, "also c")).unwrap();
    sim.settle();

    let before = sim.sorted_records("a");
    assert_eq!(before.len(), 4);
    assert_eq!(sim.sorted_records("b"), before);

    sim.leave("c");

    let expected: Vec<Record> = before.into_iter().filter(|r| r.id <= 2).collect();
    assert_eq!(sim.sorted_records("a"), expected);
    assert_eq!(sim.sorted_records("b"), expected);
    for name in ["a", "b"] {
        assert!(sim.node(name).entries().iter().all(|e| e.source_node != "c"));
    }
}

#[test]
fn test_all_nodes_converge() {
    let names = ["a", "b", "c", "d", "e"];
    let sim = Sim::with_nodes(&names);
    for (n, name) in names.iter().enumerate() {
        for k in 0..3 {
            let id = (n * 10 + k) as i64;
            sim.node(name)
                .create_record(Record::new(id, format!("{}-{}", name, k)))
                .unwrap();
        }
    }
    sim.settle();

    let reference = sim.sorted_entries("a");
    assert_eq!(reference.len(), 15);
    for name in names {
        assert_eq!(sim.sorted_entries(name), reference);
        assert_eq!(sim.node(name).stats().digest, sim.node("a").stats().digest);
    }
}

#[test]
fn test_relay_carries_creations_beyond_direct_peers() {
    let names = ["a", "b", "c", "d", "e"];
    let sim = Sim::with_nodes(&names);
    sim.node("a").create_record(Record::new(1, "x")).unwrap();
    sim.settle_ring();

    for name in names {
        assert_eq!(sim.sorted_records(name), vec![Record::new(1, "x")]);
    }
}

#[test]
fn test_without_relay_only_direct_peers_learn() {
    let sim = Sim::with_settings(
        &["a", "b", "c"],
        NodeSettings {
            relay: false,
            ..NodeSettings::default()
        },
    );
    sim.node("a").create_record(Record::new(1, "x")).unwrap();
    sim.settle_ring();

    assert_eq!(sim.sorted_records("b"), vec![Record::new(1, "x")]);
    assert!(sim.sorted_records("c").is_empty());
}

#[test]
fn test_concurrent_creates_of_one_id_never_duplicate() {
    let sim = Sim::with_nodes(&["a", "b", "c"]);
    sim.node("a").create_record(Record::new(9, "a says")).unwrap();
    sim.node("b").create_record(Record::new(9, "b says")).unwrap();
    sim.settle();

    for name in ["a", "b", "c"] {
        let copies = sim
            .node(name)
            .list_records()
            .into_iter()
            .filter(|r| r.id == 9)
            .count();
        assert_eq!(copies, 1);
    }
    // each origin keeps its own first value
    assert_eq!(sim.sorted_records("a"), vec![Record::new(9, "a says")]);
    assert_eq!(sim.sorted_records("b"), vec![Record::new(9, "b says")]);
}

#[test]
fn test_join_merges_full_state_both_ways() {
    let mut sim = Sim::with_nodes(&["a", "b"]);
    sim.node("a").create_record(Record::new(1, "a one")).unwrap();
    sim.node("b").create_record(Record::new(2, "b two")).unwrap();
    sim.settle();

    sim.add("d", NodeSettings::default());
    sim.node("d").create_record(Record::new(1, "d one")).unwrap();
    sim.node("d").create_record(Record::new(3, "d three")).unwrap();
    let seed_before = by_id(sim.node("a").entries());
    let joiner_before = by_id(sim.node("d").entries());

    sim.join("d", "a");

    let joiner_after = by_id(sim.node("d").entries());
    for (id, entry) in &seed_before {
        assert_eq!(joiner_after.get(id), Some(entry));
    }
    assert_eq!(joiner_after.get(&3), joiner_before.get(&3));

    let seed_after = by_id(sim.node("a").entries());
    for (id, entry) in &joiner_before {
        assert_eq!(seed_after.get(id), Some(entry));
    }
    assert_eq!(seed_after.get(&2), seed_before.get(&2));
    assert_eq!(sim.node("d").stats().members, 3);
}

#[test]
fn test_join_merge_can_keep_local_copies() {
    let settings = NodeSettings {
        merge_policy: MergePolicy::KeepLocal,
        ..NodeSettings::default()
    };
    let mut sim = Sim::with_settings(&["a"], settings.clone());
    sim.node("a").create_record(Record::new(1, "a one")).unwrap();
    sim.add("d", settings);
    sim.node("d").create_record(Record::new(1, "d one")).unwrap();
    sim.node("d").create_record(Record::new(2, "d two")).unwrap();

    sim.join("d", "a");

    assert_eq!(
        sim.sorted_records("a"),
        vec![Record::new(1, "a one"), Record::new(2, "d two")]
    );
    assert_eq!(
        sim.sorted_records("d"),
        vec![Record::new(1, "d one"), Record::new(2, "d two")]
    );
}

#[test]
fn test_late_relay_does_not_resurrect_departed_records() {
    let mut sim = Sim::with_nodes(&["a", "b", "c"]);
    sim.node("c").create_record(Record::new(5, "from c")).unwrap();

    // only a hears about it before c goes away
    let c = sim.index("c");
    let a = sim.index("a");
    let messages = sim.drain(c);
    sim.deliver(a, &messages);
    assert_eq!(sim.node("a").stats().pending_broadcasts, 1);

    sim.leave("c");
    assert!(sim.node("a").list_records().is_empty());

    sim.settle();
    assert!(sim.node("a").list_records().is_empty());
    assert!(sim.node("b").list_records().is_empty());
}

#[test]
fn test_departed_node_can_rejoin() {
    let mut sim = Sim::with_nodes(&["a", "b"]);
    sim.node("b").create_record(Record::new(1, "first life")).unwrap();
    sim.settle();
    sim.leave("b");
    assert!(sim.node("a").list_records().is_empty());

    sim.add("b", NodeSettings::default());
    sim.node("b").create_record(Record::new(2, "second life")).unwrap();
    sim.join("b", "a");

    assert_eq!(sim.sorted_records("a"), vec![Record::new(2, "second life")]);
    sim.node("b").create_record(Record::new(3, "after join")).unwrap();
    sim.settle();
    assert_eq!(sim.sorted_records("a").len(), 2);
}

#[test]
fn test_restart_purges_previous_records() {
    let mut sim = Sim::with_nodes(&["a", "b"]);
    sim.node("a").create_record(Record::new(1, "a one")).unwrap();
    sim.node("b").create_record(Record::new(2, "b two")).unwrap();
    sim.settle();

    sim.restart("b");

    assert_eq!(sim.sorted_records("a"), vec![Record::new(1, "a one")]);
    assert!(sim.sorted_records("b").is_empty());
}

#[test]
fn test_late_relay_does_not_resurrect_records_of_a_previous_life() {
    let mut sim = Sim::with_nodes(&["a", "b", "c"]);
    sim.node("b").create_record(Record::new(5, "old life")).unwrap();

    // only a hears about it before b restarts
    let b = sim.index("b");
    let a = sim.index("a");
    let messages = sim.drain(b);
    sim.deliver(a, &messages);

    sim.restart("b");
    assert!(sim.node("a").list_records().is_empty());

    sim.settle();
    for name in ["a", "b", "c"] {
        assert!(sim.node(name).list_records().is_empty(), "{} resurrected", name);
    }

    sim.node("b").create_record(Record::new(6, "new life")).unwrap();
    sim.settle();
    for name in ["a", "b", "c"] {
        assert_eq!(sim.sorted_records(name), vec![Record::new(6, "new life")]);
    }
}

#[test]
fn test_recovered_member_restores_its_records() {
    let mut sim = Sim::with_nodes(&["a", "b"]);
    sim.node("b").create_record(Record::new(1, "survivor")).unwrap();
    sim.settle();

    sim.leave("b");
    assert!(sim.node("a").list_records().is_empty());

    // same life: the failure was only a partition
    sim.recover("b");
    sim.join("b", "a");
    assert_eq!(sim.sorted_records("a"), vec![Record::new(1, "survivor")]);
}

#[test]
fn test_leave_only_trigger_ignores_restarts() {
    let settings = NodeSettings {
        gc_trigger: GcTrigger::Leave,
        ..NodeSettings::default()
    };
    let mut sim = Sim::with_settings(&["a", "b"], settings);
    sim.node("b").create_record(Record::new(2, "b two")).unwrap();
    sim.settle();

    sim.restart("b");
    assert_eq!(sim.sorted_records("a"), vec![Record::new(2, "b two")]);

    sim.leave("b");
    assert!(sim.sorted_records("a").is_empty());
}

// demos/single_varrw_usage.rs
//
// Example demonstrating a custom SingleVarBackend: a flow record whose
// attributes are read lazily and whose writes are batched at sync

use policy_vm::{
    evaluate, Element, ElementFactory, Operator, Policy, Program, SetManager, SingleVarBackend,
    SingleVarRW, TermBuilder, VarId, VarInit, VarRW,
};
use std::sync::Arc;

const PEER_AS: VarId = VarId::protocol(0);
const COMMUNITY: VarId = VarId::protocol(1);
const LOCAL_PREF: VarId = VarId::protocol(2);

/// Backend over a toy BGP-like path record
#[derive(Debug)]
struct PathRecord {
    peer_as: u32,
    community: String,
    local_pref: u32,
    reads: Vec<VarId>,
    batches: u32,
}

impl SingleVarBackend for PathRecord {
    fn start_read(&mut self, init: &mut VarInit<'_>) {
        // Cheap attributes are handed over up front.
        init.initialize(PEER_AS, Some(Element::U32(self.peer_as)));
    }

    fn single_read(&mut self, id: VarId) -> Option<Element> {
        self.reads.push(id);
        match id {
            COMMUNITY => Some(Element::from(self.community.as_str())),
            LOCAL_PREF => Some(Element::U32(self.local_pref)),
            _ => None,
        }
    }

    fn start_write(&mut self) {
        println!("  start_write");
    }

    fn single_write(&mut self, id: VarId, value: &Element) {
        println!("  single_write {} = {}", id, value);
        if let (LOCAL_PREF, Some(pref)) = (id, value.as_u32()) {
            self.local_pref = pref;
        }
    }

    fn end_write(&mut self) {
        self.batches += 1;
        println!("  end_write");
    }
}

fn main() -> Result<(), String> {
    println!("=== SingleVarRW Usage Examples ===\n");

    // Example 1: Lazy reads
    lazy_reads()?;

    // Example 2: Batched writes
    batched_writes()?;

    println!("\n=== All Examples Completed Successfully ===");
    Ok(())
}

fn record(peer_as: u32, community: &str) -> SingleVarRW<PathRecord> {
    SingleVarRW::new(PathRecord {
        peer_as,
        community: community.to_string(),
        local_pref: 100,
        reads: Vec::new(),
        batches: 0,
    })
}

// ============================================================================
// Example 1: Lazy Reads
// ============================================================================

fn lazy_reads() -> Result<(), String> {
    println!("--- Example 1: Lazy Reads ---");

    let mut rw = record(65001, "65001:666");
    for _ in 0..3 {
        rw.read(COMMUNITY);
    }
    println!("✓ peer_as (preloaded): {}", rw.read(PEER_AS));
    println!("✓ backend reads: {:?}", rw.backend().reads);
    rw.sync();
    println!("✓ write batches after read-only run: {}\n", rw.backend().batches);
    Ok(())
}

// ============================================================================
// Example 2: Batched Writes
// ============================================================================

fn batched_writes() -> Result<(), String> {
    println!("--- Example 2: Batched Writes ---");

    // Lower local preference of blackhole-tagged paths from listed peers.
    let peers = ElementFactory::create("set_u32", Some("65001,65002")).map_err(|e| e.to_string())?;
    let sets = SetManager::new().with_set("peers", peers);
    let program = Program::new().with_policy(
        Policy::new("blackhole").with_term(
            TermBuilder::new("depref")
                .push_set("peers")
                .load(PEER_AS)
                .op(Operator::Ctr)
                .on_false_exit()
                .load(COMMUNITY)
                .push(":666$")
                .op(Operator::Regex)
                .on_false_exit()
                .push(10u32)
                .store(LOCAL_PREF)
                .accept()
                .build(),
        ),
    );
    let program = Arc::new(program);
    let sets = Arc::new(sets);

    for (peer, community) in [(65001, "65001:666"), (65003, "65003:666")] {
        let mut rw = record(peer, community);
        let eval = evaluate(program.clone(), sets.clone(), &mut rw, false).map_err(|e| e.to_string())?;
        println!(
            "✓ peer {} -> {} (local_pref {}, batches {})",
            peer,
            eval.action,
            rw.backend().local_pref,
            rw.backend().batches
        );
    }
    Ok(())
}

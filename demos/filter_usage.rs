// demos/filter_usage.rs
//
// Example demonstrating PolicyFilter usage: building programs, named sets,
// tracing and concurrent filtering

use policy_vm::route_varrw::var;
use policy_vm::{
    Element, ElementFactory, FlowAction, Ipv4Net, Operator, PolicyFilter, Policy, Program,
    RouteBackend, RouteEntry, RouteVarRW, TermBuilder, VarId,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;

fn main() -> Result<(), String> {
    println!("=== PolicyFilter Usage Examples ===\n");

    // Example 1: Metric filter
    metric_filter()?;

    // Example 2: Named sets and tagging
    sets_and_tags()?;

    // Example 3: Execution trace
    execution_trace()?;

    // Example 4: Programs as JSON
    json_programs()?;

    // Example 5: Concurrent filtering
    concurrent_filtering()?;

    println!("\n=== All Examples Completed Successfully ===");
    Ok(())
}

fn route(net: &str, metric: u32) -> Result<RouteVarRW, String> {
    let net: Ipv4Net = net.parse().map_err(|e| format!("{}", e))?;
    Ok(RouteVarRW::new(RouteBackend::new(RouteEntry::v4(
        net,
        Ipv4Addr::new(192, 0, 2, 1),
        metric,
    ))))
}

fn reject_low_metric() -> Program {
    Program::new().with_policy(
        Policy::new("metric").with_term(
            TermBuilder::new("low")
                .load(var::METRIC)
                .push(5u32)
                .op(Operator::Lt)
                .on_false_exit()
                .reject()
                .build(),
        ),
    )
}

// ============================================================================
// Example 1: Metric Filter
// ============================================================================

fn metric_filter() -> Result<(), String> {
    println!("--- Example 1: Metric Filter ---");

    let filter = PolicyFilter::new();
    let version = filter
        .configure(reject_low_metric())
        .map_err(|e| e.to_string())?;
    println!("✓ Configured version {}", version);

    for metric in [3, 10] {
        let mut rw = route("10.0.0.0/8", metric)?;
        let accepted = filter.accept_route(&mut rw);
        println!("  metric {:>2} -> {}", metric, if accepted { "accepted" } else { "rejected" });
    }
    println!();
    Ok(())
}

// ============================================================================
// Example 2: Named Sets and Tagging
// ============================================================================

fn sets_and_tags() -> Result<(), String> {
    println!("--- Example 2: Named Sets and Tagging ---");

    let filter = PolicyFilter::new();
    let private = ElementFactory::create("set_ipv4net", Some("10.0.0.0/8,192.168.0.0/16"))
        .map_err(|e| e.to_string())?;
    filter.update_set("private", private);

    // Tag private destinations with 100, then accept them.
    let program = Program::new().with_policy(
        Policy::new("private").with_term(
            TermBuilder::new("tag")
                .push_set("private")
                .load(var::NETWORK4)
                .op(Operator::Ctr)
                .on_false_exit()
                .load(VarId::POLICYTAGS)
                .push(100u32)
                .op(Operator::Add)
                .store(VarId::POLICYTAGS)
                .accept()
                .build(),
        ),
    );
    filter.configure(program).map_err(|e| e.to_string())?;

    for net in ["10.0.0.0/8", "198.51.100.0/24"] {
        let mut rw = route(net, 1)?;
        let eval = filter.evaluate(&mut rw, false).map_err(|e| e.to_string())?;
        println!(
            "  {:<16} -> {:<14} tags {:?}",
            net,
            eval.action.to_string(),
            rw.backend().route().policytags
        );
    }
    println!();
    Ok(())
}

// ============================================================================
// Example 3: Execution Trace
// ============================================================================

fn execution_trace() -> Result<(), String> {
    println!("--- Example 3: Execution Trace ---");

    let filter = PolicyFilter::new();
    filter
        .configure(reject_low_metric())
        .map_err(|e| e.to_string())?;

    let mut rw = route("10.0.0.0/8", 2)?;
    let eval = filter.evaluate(&mut rw, true).map_err(|e| e.to_string())?;
    for line in eval.trace.unwrap_or_default().lines() {
        println!("  | {}", line);
    }
    println!("✓ Outcome: {}\n", eval.action);
    Ok(())
}

// ============================================================================
// Example 4: Programs as JSON
// ============================================================================

fn json_programs() -> Result<(), String> {
    println!("--- Example 4: Programs as JSON ---");

    let json = reject_low_metric().to_json().map_err(|e| e.to_string())?;
    println!("✓ Serialized program ({} bytes)", json.len());

    let program = Program::from_json(&json).map_err(|e| e.to_string())?;
    println!("✓ Loaded program:");
    for line in program.to_string().lines() {
        println!("  {}", line);
    }

    let literal = ElementFactory::create("ipv4", Some("192.0.2.1")).map_err(|e| e.to_string())?;
    let encoded = serde_json::to_string(&literal).map_err(|e| e.to_string())?;
    println!("✓ Element on the wire: {}\n", encoded);
    Ok(())
}

// ============================================================================
// Example 5: Concurrent Filtering
// ============================================================================

fn concurrent_filtering() -> Result<(), String> {
    println!("--- Example 5: Concurrent Filtering ---");

    let filter = Arc::new(PolicyFilter::new());
    filter
        .configure(reject_low_metric())
        .map_err(|e| e.to_string())?;

    let mut handles = vec![];
    for worker in 0..4u32 {
        // One interpreter per thread, all sharing the same snapshot.
        let mut exec = filter.executor();
        handles.push(thread::spawn(move || {
            let mut rejected = 0;
            for metric in 0..100u32 {
                let entry = RouteEntry::v4(
                    "10.0.0.0/8".parse().expect("valid prefix"),
                    Ipv4Addr::new(10, 0, 0, worker as u8),
                    metric,
                );
                let mut rw = RouteVarRW::new(RouteBackend::new(entry));
                if exec.run(&mut rw, None) == Ok(FlowAction::Reject) {
                    rejected += 1;
                }
            }
            rejected
        }));
    }

    for (worker, handle) in handles.into_iter().enumerate() {
        let rejected = handle.join().map_err(|_| "worker panicked".to_string())?;
        println!("  worker {} rejected {} routes", worker, rejected);
    }

    let current = Element::Filter(filter.handle());
    println!("✓ Filter element: {} (version {})\n", current, filter.version());
    Ok(())
}

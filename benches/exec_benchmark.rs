use criterion::{black_box, criterion_group, criterion_main, Criterion};
use policy_vm::route_varrw::var;
use policy_vm::{
    ElementFactory, IvExec, Operator, Policy, Program, RouteBackend, RouteEntry, RouteVarRW,
    SetManager, TermBuilder, VarId,
};
use std::net::Ipv4Addr;
use std::sync::Arc;

fn program() -> Arc<Program> {
    let mut policy = Policy::new("bench");
    for i in 0..8u32 {
        policy = policy.with_term(
            TermBuilder::new(format!("metric-{}", i))
                .load(var::METRIC)
                .push(i)
                .op(Operator::Eq)
                .on_false_exit()
                .reject()
                .build(),
        );
    }
    policy = policy.with_term(
        TermBuilder::new("private")
            .push_set("private")
            .load(var::NETWORK4)
            .op(Operator::Ctr)
            .on_false_exit()
            .load(VarId::POLICYTAGS)
            .push(42u32)
            .op(Operator::Add)
            .store(VarId::POLICYTAGS)
            .accept()
            .build(),
    );
    Arc::new(Program::new().with_policy(policy))
}

fn sets() -> Arc<SetManager> {
    let private = ElementFactory::create("set_ipv4net", Some("10.0.0.0/8,172.16.0.0/12"))
        .expect("valid set");
    Arc::new(SetManager::new().with_set("private", private))
}

fn route() -> RouteEntry {
    RouteEntry::v4("10.0.0.0/8".parse().expect("valid prefix"), Ipv4Addr::new(10, 0, 0, 1), 20)
}

pub fn run_bench(c: &mut Criterion) {
    let mut exec = IvExec::new(program(), sets());
    let mut rw = RouteVarRW::new(RouteBackend::new(route()));

    c.bench_function("run_accept_with_tag", |b| {
        b.iter(|| {
            rw.backend_mut().set_route(route());
            black_box(exec.run(&mut rw, None))
        })
    });

    let mut trace = String::new();
    c.bench_function("run_traced", |b| {
        b.iter(|| {
            trace.clear();
            rw.backend_mut().set_route(route());
            black_box(exec.run(&mut rw, Some(&mut trace)))
        })
    });
}

criterion_group!(benches, run_bench);
criterion_main!(benches);

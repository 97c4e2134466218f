use cinnabar::il::parse_method;
use cinnabar::vm::bridge::{ClosedBridge, SymbolTables};
use cinnabar::{PatchConfig, PatchSession, Value, Vm};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const GCD: &str = "\
    .method gcd args=2 locals=2\n\
    ldarg 0\n\
    stloc 0\n\
    ldarg 1\n\
    stloc 1\n\
    top:\n\
    ldloc 1\n\
    ldc.i4 0\n\
    beq done\n\
    ldloc 1\n\
    ldloc 0\n\
    ldloc 1\n\
    rem\n\
    stloc 1\n\
    stloc 0\n\
    br top\n\
    done:\n\
    ldloc 0\n\
    ret\n";

const FIB: &str = "\
    .method fib args=1 locals=3\n\
    ldc.i4 0\n\
    stloc 0\n\
    ldc.i4 1\n\
    stloc 1\n\
    ldarg 0\n\
    stloc 2\n\
    top:\n\
    ldloc 2\n\
    ldc.i4 0\n\
    ble done\n\
    ldloc 1\n\
    ldloc 0\n\
    ldloc 1\n\
    add\n\
    stloc 1\n\
    stloc 0\n\
    ldloc 2\n\
    ldc.i4 1\n\
    sub\n\
    stloc 2\n\
    br top\n\
    done:\n\
    ldloc 0\n\
    ret\n";

fn bench_compile(c: &mut Criterion) {
    let tables = SymbolTables::new();
    let gcd = parse_method(GCD, &tables).unwrap();
    let fib = parse_method(FIB, &tables).unwrap();
    let session = PatchSession::new(PatchConfig::all(), tables);

    let mut group = c.benchmark_group("compile");
    group.bench_function("gcd", |b| {
        b.iter(|| session.compile(black_box(&gcd)).unwrap())
    });
    group.bench_function("fib", |b| {
        b.iter(|| session.compile(black_box(&fib)).unwrap())
    });
    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let tables = SymbolTables::new();
    let gcd = parse_method(GCD, &tables).unwrap();
    let fib = parse_method(FIB, &tables).unwrap();
    let session = PatchSession::new(PatchConfig::all(), tables);
    let gcd = session.compile(&gcd).unwrap().program;
    let fib = session.compile(&fib).unwrap().program;
    let mut vm = Vm::new();

    let mut group = c.benchmark_group("execute");
    group.bench_function("gcd_1071_462", |b| {
        let args = [Value::from_i32(1071), Value::from_i32(462)];
        b.iter(|| vm.call(black_box(&gcd), &args, &mut ClosedBridge).unwrap())
    });
    group.bench_function("fib_30", |b| {
        let args = [Value::from_i32(30)];
        b.iter(|| vm.call(black_box(&fib), &args, &mut ClosedBridge).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);

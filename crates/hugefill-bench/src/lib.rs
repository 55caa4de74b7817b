//! Benchmark-only crate; see `benches/filler_bench.rs`.

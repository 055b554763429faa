use criterion::{Criterion, black_box, criterion_group, criterion_main};
use host_metrics_sse::sse::Frame;
use host_metrics_sse::stats::{
    CpuBaseline, CpuUsage, DiskUsage, MemoryUsage, Sample, Sampler, SamplerConfig, clamp_percent,
    parse_cpu_times, parse_df_output, parse_meminfo,
};
use tokio::runtime::Runtime;

const PROC_STAT: &str = "cpu  2255 34 2290 22625563 6290 127 456 0 0 0\n\
cpu0 1132 34 1441 11311718 3675 127 438 0 0 0\n\
cpu1 1123 0 849 11313845 2614 0 18 0 0 0\n\
intr 114930548 113199788 3 0 5 263 0 4 [... lots more numbers ...]\n\
ctxt 1990473\nbtime 1062191376\nprocesses 2915\nprocs_running 1\nprocs_blocked 0\n";

const PROC_MEMINFO: &str = "MemTotal:       16303428 kB\nMemFree:         1245260 kB\n\
MemAvailable:    9862852 kB\nBuffers:          460380 kB\nCached:          7936972 kB\n\
SwapCached:            0 kB\nActive:          6381764 kB\nInactive:        7304356 kB\n";

const DF_OUTPUT: &str = "Filesystem       1-blocks         Used    Available Capacity Mounted on\n\
/dev/nvme0n1p2 502392610816 212312494080 264444407808      45% /\n";

fn create_test_sample() -> Sample {
    Sample {
        timestamp: 1_700_000_000_000,
        cpu: CpuUsage { usage: 37.5 },
        mem: MemoryUsage {
            total: 16 * 1024 * 1024 * 1024,   // 16GB
            used: 6 * 1024 * 1024 * 1024,     // 6GB
            free: 10 * 1024 * 1024 * 1024,   // 10GB
            usage: 37.5,
        },
        disk: DiskUsage {
            total: 512 * 1024 * 1024 * 1024, // 512GB
            used: 200 * 1024 * 1024 * 1024,  // 200GB
            free: 312 * 1024 * 1024 * 1024,  // 312GB
            usage: 39.1,
            mount: "/".to_string(),
        },
    }
}

fn bench_parsing(c: &mut Criterion) {
    c.bench_function("parse_proc_stat", |b| {
        b.iter(|| {
            let times = parse_cpu_times(black_box(PROC_STAT));
            let _ = black_box(times);
        })
    });

    c.bench_function("parse_proc_meminfo", |b| {
        b.iter(|| {
            let mem = parse_meminfo(black_box(PROC_MEMINFO));
            let _ = black_box(mem);
        })
    });

    c.bench_function("parse_df_output", |b| {
        b.iter(|| {
            let disk = parse_df_output(black_box(DF_OUTPUT), "/");
            let _ = black_box(disk);
        })
    });
}

fn bench_cpu_baseline(c: &mut Criterion) {
    let baseline = CpuBaseline::new();
    let times = parse_cpu_times(PROC_STAT).unwrap();

    c.bench_function("cpu_baseline_advance", |b| {
        b.iter(|| {
            let usage = baseline.advance(black_box(&times));
            black_box(clamp_percent(usage));
        })
    });
}

fn bench_frame_encoding(c: &mut Criterion) {
    let sample = create_test_sample();

    c.bench_function("sse_data_frame", |b| {
        b.iter(|| {
            let frame = Frame::sample(black_box(&sample)).unwrap();
            black_box(frame.encode());
        })
    });

    c.bench_function("sse_error_frame", |b| {
        b.iter(|| {
            black_box(Frame::Error.encode());
        })
    });
}

fn bench_host_sampling(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let sampler = Sampler::new(SamplerConfig::default());

    c.bench_function("host_sample", |b| {
        b.iter(|| {
            rt.block_on(async {
                let sample = sampler.sample().await;
                let _ = black_box(sample);
            })
        })
    });
}

criterion_group!(
    benches,
    bench_parsing,
    bench_cpu_baseline,
    bench_frame_encoding,
    bench_host_sampling
);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use regolith::tile::encode_pgm;
use regolith::{convert, detect, DetectionConfig, MeshConfig, Tile, TileGeometry, TileStore};

const SIZE: usize = 512;

/// Rolling terrain with a few bowl-shaped pits.
fn synthetic_samples() -> Vec<u16> {
    let pits = [(128.0, 128.0, 30.0), (300.0, 200.0, 45.0), (400.0, 420.0, 20.0)];
    (0..SIZE * SIZE)
        .map(|i| {
            let (r, c) = ((i / SIZE) as f64, (i % SIZE) as f64);
            let mut h = 2000.0 + 300.0 * (r / 40.0).sin() * (c / 55.0).cos();
            for &(pr, pc, radius) in &pits {
                let d = ((r - pr).powi(2) + (c - pc).powi(2)).sqrt();
                if d < radius {
                    h -= 800.0 * (1.0 - (d / radius).powi(2));
                }
            }
            h as u16
        })
        .collect()
}

fn synthetic_tile() -> Tile {
    Tile::from_samples(
        SIZE,
        SIZE,
        4095,
        &synthetic_samples(),
        TileGeometry::new(0.05, 0.001),
    )
    .unwrap()
}

fn bench_detect(c: &mut Criterion) {
    let tile = synthetic_tile();
    let config = DetectionConfig::default();

    c.bench_function("detect_512", |b| {
        b.iter(|| black_box(detect(black_box(&tile), &config).unwrap()));
    });
}

fn bench_convert(c: &mut Criterion) {
    let tile = synthetic_tile();
    let config = MeshConfig::default()
        .with_target_width(256)
        .with_target_face_count(20_000);

    c.bench_function("convert_512_to_20k_faces", |b| {
        b.iter(|| black_box(convert(black_box(&tile), &config).unwrap()));
    });
}

fn bench_cached_tile(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let bytes = encode_pgm(SIZE, SIZE, 4095, &synthetic_samples(), None).unwrap();
    std::fs::write(tmp.path().join("lat-30_lon000.pgm"), bytes).unwrap();
    let store = TileStore::open(tmp.path(), 4).unwrap();

    // Warm the cache
    let _ = store.get_tile(-30, 0);

    c.bench_function("get_tile_cached", |b| {
        b.iter(|| black_box(store.get_tile(black_box(-30), black_box(0)).unwrap()));
    });
}

criterion_group!(benches, bench_detect, bench_convert, bench_cached_tile);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use geofire::{covering_ranges, GeoFire, GeoHash, Location, QueryMode};

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let location = Location::new(37.7749, -122.4194).unwrap();

    for precision in [5, 10, 12] {
        group.bench_with_input(
            BenchmarkId::new("encode", precision),
            &precision,
            |b, &precision| b.iter(|| GeoHash::encode(black_box(&location), precision).unwrap()),
        );
    }

    let hash = GeoHash::encode(&location, 10).unwrap();
    group.bench_function("neighbors", |b| b.iter(|| black_box(&hash).neighbors().unwrap()));

    for radius in [100.0, 5_000.0, 500_000.0] {
        group.bench_with_input(
            BenchmarkId::new("covering_ranges", radius as u64),
            &radius,
            |b, &radius| b.iter(|| covering_ranges(black_box(&location), radius, 10).unwrap()),
        );
    }

    group.finish();
}

fn benchmark_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    let geofire = GeoFire::memory().unwrap();

    group.bench_function("set_location", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            let lat = 40.7128 + (counter % 1000) as f64 * 0.0001;
            let lon = -74.0060 + (counter % 997) as f64 * 0.0001;
            counter += 1;
            geofire
                .set_location(
                    black_box(&format!("driver:{}", counter % 10_000)),
                    Location::new(lat, lon).unwrap(),
                    None,
                )
                .unwrap()
        })
    });

    group.bench_function("get_location", |b| {
        b.iter(|| geofire.get_location(black_box("driver:42")).unwrap())
    });

    group.finish();
}

fn benchmark_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queries");
    let geofire = GeoFire::memory().unwrap();
    let center = Location::new(40.7128, -74.0060).unwrap();
    for i in 0..10_000u64 {
        let lat = center.latitude() + ((i * 37) % 200) as f64 * 0.0005 - 0.05;
        let lon = center.longitude() + ((i * 91) % 200) as f64 * 0.0005 - 0.05;
        geofire
            .set_location(&format!("p{}", i), Location::new(lat, lon).unwrap(), None)
            .unwrap();
    }

    for radius in [250.0, 1_000.0, 5_000.0] {
        group.bench_with_input(
            BenchmarkId::new("start_query", radius as u64),
            &radius,
            |b, &radius| {
                b.iter(|| {
                    let (query, _events) = geofire
                        .query_at_location(black_box(center), radius, QueryMode::Locations)
                        .unwrap();
                    query.stop().unwrap();
                })
            },
        );
    }

    // Notification fan-out with a live query watching the area
    let (_query, events) = geofire
        .query_at_location(center, 1_000.0, QueryMode::Locations)
        .unwrap();
    group.bench_function("update_inside_live_query", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            let lon = center.longitude() + (counter % 50) as f64 * 0.0001;
            counter += 1;
            geofire
                .set_location("mover", Location::new(center.latitude(), lon).unwrap(), None)
                .unwrap();
            events.try_iter().count()
        })
    });

    group.finish();
}

criterion_group!(benches, benchmark_codec, benchmark_store, benchmark_queries);
criterion_main!(benches);

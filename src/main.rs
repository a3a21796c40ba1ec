//! Line-oriented JSON transport: one command per stdin line, one response per
//! stdout line, with query events interleaved as they happen.
//!
//! ```text
//! $ geofire [path/to/store.aof]
//! {"method": "setLocation", "id": "a", "location": {"latitude": 0.0, "longitude": 0.0}}
//! {"status":"ok","result":"done"}
//! {"method": "startQuery", "center": {"latitude": 0.0, "longitude": 0.001}, "radius": 500}
//! {"query":"…","mode":"locations","callBack":"entered","id":"a",...}
//! ```

use geofire::GeoFire;
use std::io::{self, BufRead, Write};
use std::thread;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let geofire = match std::env::args().nth(1) {
        Some(path) => GeoFire::open(path)?,
        None => GeoFire::memory()?,
    };

    let events = geofire.session().listen();
    let printer = thread::spawn(move || {
        for event in events {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(err) => eprintln!("failed to encode event: {}", err),
            }
        }
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = geofire.session().dispatch_json(&line);
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", response)?;
        stdout.flush()?;
    }

    geofire.session().cancel()?;
    drop(geofire);
    printer
        .join()
        .map_err(|_| io::Error::other("event printer panicked"))?;
    Ok(())
}

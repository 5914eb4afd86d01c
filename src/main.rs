fn main() {
    if let Err(err) = scene_raster::run() {
        eprintln!("Application error: {err}");
    }
}

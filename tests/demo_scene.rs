use scene_raster::demo::{DemoScene, Renderable};
use scene_raster::gpu::HeadlessContext;
use scene_raster::settings::RasterSettings;
use scene_raster::time::ManualTicks;
use scene_raster::SceneRasterizer;

fn headless_demo(seed: u64) -> (HeadlessContext, SceneRasterizer, DemoScene, ManualTicks) {
    scene_raster::init_logging();
    let clock = ManualTicks::new(0);
    let mut ctx = HeadlessContext::new(64, 48);
    let mut raster = SceneRasterizer::new(RasterSettings::default(), Box::new(clock.clone()));
    raster.initialize(&mut ctx).expect("rasterizer initializes");
    let scene = DemoScene::new(&mut ctx, &mut raster, None, seed);
    (ctx, raster, scene, clock)
}

#[test]
fn demo_renders_shadowed_frames_headless() {
    let (mut ctx, mut raster, mut scene, clock) = headless_demo(7);
    assert_eq!(scene.visible_lights().len(), 4, "sun plus three orbiting lights");

    let first = scene.render(&mut ctx, &mut raster);
    assert!(first.draw_calls > 0);
    assert!(first.shadow_passes >= 4, "sun cascades render");
    assert_eq!(first.dropped_elements, 0);

    clock.advance(16);
    scene.update(&mut raster, 0.016);
    let second = scene.render(&mut ctx, &mut raster);
    assert!(second.draw_calls > 0);
}

#[test]
fn same_seed_builds_the_same_world() {
    let (_, _, a, _) = headless_demo(3);
    let (_, _, b, _) = headless_demo(3);
    let count = |scene: &DemoScene| scene.world().query::<&Renderable>().iter().count();
    assert_eq!(count(&a), count(&b));
    assert!(count(&a) > 1);
}

use std::sync::Arc;
use std::time::Duration;

use servo_gripper::*;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), GripperError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // The serial port path
    let path = std::env::args().nth(1).unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    // configuration, from a json file if one is given
    let config = match std::env::args().nth(2) {
        Some(file) => GripperConfig::from_json(&std::fs::read_to_string(file)?)?,
        None => GripperConfig::default(),
    };
    let config = Arc::new(config);

    // zero reference from an earlier calibration run
    let store_path = std::path::Path::new("calibration.json");
    let mut store = CalibrationStore::load_or_default(store_path)?;
    let zero = store.get(&path).unwrap_or_default();

    let mut gripper = Gripper::from_path(path.clone(), config, zero)?;
    gripper.initialize().await?;

    // Calibration
    //
    // drive onto the closed hard stop and record it as zero
    for _ in 0..100 {
        gripper.cycle(Target::new(0.0, 30.0)).await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let zero = gripper.record_zero().await?;
    store.set(path, zero);
    store.save(store_path)?;
    println!("zero reference : {:?}", zero);

    // State publishing
    //
    // a second task only ever sees the latest published state
    let mut states = gripper.subscribe();
    let publisher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!(
                "{:6.1}% {:5.1}% {:?} {:?}",
                state.position, state.effort, state.grasp, state.mode
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    // Control loop
    //
    // open, close on whatever is between the fingers, hold, release
    let (commands, rx) = watch::channel(Target::new(100.0, 100.0));
    let script = async move {
        for (position, hold) in [(100.0, 1000), (0.0, 3000), (100.0, 1000)] {
            commands.send_replace(Target::new(position, 60.0));
            tokio::time::sleep(Duration::from_millis(hold)).await;
        }
    };
    let (result, ()) = tokio::join!(gripper.run(rx, Duration::from_millis(10)), script);
    result?;

    gripper.disable().await?;
    drop(gripper);
    let _ = publisher.await;
    Ok(())
}

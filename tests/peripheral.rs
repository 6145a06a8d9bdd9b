use std::{
    fs,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use periphlink::{
    codec::{Rgb, Value},
    command::{CommandStatus, Opcode},
    connection::Transport,
    error::Error,
    registry::{AttachedPort, PortEnumerator},
    DeviceProfile,
    Peripheral,
};
use pretty_assertions::assert_eq;

mod common;

use common::{MockDevice, PORT};

fn connected(device: &MockDevice) -> Peripheral {
    let mut peripheral = Peripheral::new(DeviceProfile::ecool()).unwrap();
    let device = device.clone();
    peripheral
        .connect_transport(PORT, move || Ok(Box::new(device.port()) as Box<dyn Transport>))
        .unwrap();

    peripheral
}

#[test]
fn blocks_run_with_defaults_and_menus() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let device = {
        let seen = seen.clone();
        MockDevice::new(move |request| {
            seen.lock().unwrap().push(request.arguments.clone());
            Some(CommandStatus::Ok(None))
        })
    };
    let peripheral = connected(&device);
    assert!(peripheral.is_connected());

    peripheral.run_block("screenSet", &[("G", "128")]).unwrap();
    peripheral.run_block("screenShow", &[("COLOR", "blue")]).unwrap();
    peripheral
        .run_block("imageDrawRectangle", &[("FILL", "Empty"), ("W", "20.6")])
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            vec![Value::Byte(255), Value::Byte(128), Value::Byte(0)],
            vec![Value::Text("BLUE".into())],
            vec![
                Value::Int(0),
                Value::Int(0),
                Value::Int(21),
                Value::Int(10),
                Value::Color(Rgb::WHITE),
                Value::Int(1),
                Value::Int(0),
            ],
        ]
    );
}

#[test]
fn reporters_return_values() {
    let device = MockDevice::new(|request| match request.opcode {
        Opcode::ConsoleFps => Some(CommandStatus::Ok(Some(Value::Float(29.5)))),
        _ => Some(CommandStatus::Ok(None)),
    });
    let peripheral = connected(&device);

    assert_eq!(
        peripheral.run_block("consoleFps", &[]).unwrap(),
        Some(Value::Float(29.5))
    );
}

#[test]
fn bad_block_invocations() {
    let device = MockDevice::acking();
    let peripheral = connected(&device);

    assert!(matches!(
        peripheral.run_block("screenExplode", &[]),
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(matches!(
        peripheral.run_block("screenShow", &[("COLOR", "MAGENTA")]),
        Err(Error::InvalidArguments { .. })
    ));
    assert!(matches!(
        peripheral.run_block("screenClear", &[("SPEED", "1")]),
        Err(Error::InvalidArguments { .. })
    ));
    assert!(device.state().requests.is_empty());
}

#[test]
fn disconnect_and_reconnect() {
    let device = MockDevice::acking();
    let mut peripheral = connected(&device);

    peripheral.disconnect();
    assert!(!peripheral.is_connected());
    assert!(matches!(
        peripheral.run_block("screenClear", &[]),
        Err(Error::NotConnected)
    ));

    // Disconnecting twice is harmless
    peripheral.disconnect();

    let mut peripheral = connected(&device);
    peripheral.reconnect().unwrap();
    assert!(peripheral.is_connected());
    assert!(peripheral.run_block("screenClear", &[]).is_ok());
}

#[test]
fn uploads_firmware_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = (0..5000u32).map(|i| i as u8).collect::<Vec<_>>();
    fs::write(dir.path().join("canmv_yahboom_v2.1.1.bin"), &firmware).unwrap();

    let device = MockDevice::acking();
    let peripheral = connected(&device);

    peripheral.upload_firmware(dir.path(), None).unwrap();
    assert_eq!(device.state().image, firmware);
}

struct Ports(Vec<AttachedPort>);

impl PortEnumerator for Ports {
    fn attached(&self) -> Result<Vec<AttachedPort>, Error> {
        Ok(self.0.clone())
    }
}

#[test]
fn scan_prefers_earliest_attached() {
    let peripheral = Peripheral::new(DeviceProfile::ecool()).unwrap();
    let at = |secs| Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));

    let ports = Ports(vec![
        AttachedPort {
            port_name: "/dev/ttyUSB1".into(),
            vid: 0x1a86,
            pid: 0x7523,
            product: Some("USB Serial".into()),
            attached_at: at(200),
        },
        AttachedPort {
            port_name: "/dev/ttyUSB0".into(),
            vid: 0x1a86,
            pid: 0x7523,
            product: None,
            attached_at: at(100),
        },
        AttachedPort {
            port_name: "/dev/ttyACM0".into(),
            vid: 0x303a,
            pid: 0x1001,
            product: None,
            attached_at: at(50),
        },
    ]);

    let candidates = peripheral.scan_with(&ports).unwrap();
    assert_eq!(candidates[0].port_name, "/dev/ttyUSB0");
    assert_eq!(candidates[0].token, "USB\\VID_1A86&PID_7523");
    assert_eq!(candidates.len(), 2);

    assert!(peripheral.scan_with(&Ports(vec![])).unwrap().is_empty());
}

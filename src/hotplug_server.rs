//! The hot-plug control server.
//!
//! Listens on a Unix socket for attach/detach/list commands from the
//! remote CLI and translates them into the controller's connect and
//! disconnect callbacks. This is the host-side USB discovery layer of
//! the device model.

use std::{
    fs::File,
    os::unix::net::{UnixListener, UnixStream},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use nusb::MaybeFuture;
use tracing::{debug, warn};

use crate::device::pci::{
    backend::Speed,
    hostdev::HostDeviceSource,
    ports::{DeviceInfo, DevicePath, NativeDeviceType},
    xhci::{XhciController, XhciError},
};
use crate::hotplug_protocol::{command::Command, response::Response};

pub fn run_hotplug_server(socket: UnixListener, xhci_controller: Arc<Mutex<XhciController>>) {
    loop {
        if let Ok((mut stream, _addr)) = socket.accept() {
            match Command::receive_from_socket(&stream) {
                Ok(command) => {
                    debug!("Received command {:?} on hotplug socket", command);
                    if let Err(e) = handle_command(command, &mut stream, &xhci_controller) {
                        // The error contains all the necessary context.
                        warn!("{:?}", e);
                    }
                }
                Err(e) => warn!("Error occurred while reading a hotplug command {}", e),
            }
        }
    }
}

fn handle_command(
    command: Command,
    socket: &mut UnixStream,
    xhci_controller: &Arc<Mutex<XhciController>>,
) -> Result<()> {
    match command {
        Command::Attach { bus, port, fd } => handle_attach(bus, port, fd, socket, xhci_controller)
            .context("Failed to handle attach command")?,
        Command::Detach { bus, port } => {
            let path = DevicePath::new(bus, &[port]);
            let response = match xhci_controller.lock().unwrap().device_disconnected(path) {
                Ok(()) => Response::SuccessfulOperation,
                Err(error) => response_from_error(&error),
            };
            response
                .send_over_socket(socket)
                .context("Failed to send the detach response")?;
        }
        Command::List => {
            let devices = xhci_controller.lock().unwrap().attached_devices();
            Response::ListFollowing
                .send_device_list(devices, socket)
                .context("Failed to handle list command")?;
        }
    };

    Ok(())
}

fn handle_attach(
    bus: u8,
    port: u8,
    fd: File,
    socket: &mut UnixStream,
    controller: &Arc<Mutex<XhciController>>,
) -> Result<()> {
    let response = attach_device(bus, port, fd, controller);
    response
        .send_over_socket(socket)
        .context("Performed hot-plug command, but failed to send the response")?;
    Ok(())
}

fn attach_device(bus: u8, port: u8, fd: File, controller: &Arc<Mutex<XhciController>>) -> Response {
    let device = match nusb::Device::from_fd(fd.into()).wait() {
        Ok(device) => device,
        Err(error) => {
            warn!("Failed to open nusb device from the supplied file descriptor: {error}");
            return Response::FailedToOpenFd;
        }
    };

    let Some(speed) = device.speed().map(Speed::from) else {
        warn!("Failed to attach device: unable to determine its speed");
        return Response::CouldNotDetermineSpeed;
    };

    let info = DeviceInfo {
        path: DevicePath::new(bus, &[port]),
        vendor_id: 0,
        product_id: 0,
        bcd_usb: if speed.is_usb2_speed() { 0x200 } else { 0x300 },
        speed,
        device_type: NativeDeviceType::Device,
    };

    let mut guard = controller.lock().unwrap();
    let source = HostDeviceSource::new(device, info, guard.self_handle());
    match guard.device_connected(info, Some(Box::new(source))) {
        Ok(()) => Response::SuccessfulOperation,
        Err(error) => response_from_error(&error),
    }
}

fn response_from_error(error: &XhciError) -> Response {
    match error {
        XhciError::PortNotAssigned(_) => Response::NotAssigned,
        XhciError::NoFreePort(_) => Response::NoFreePort,
        XhciError::AlreadyAttached(_) => Response::AlreadyAttached,
        _ => Response::NoSuchDevice,
    }
}

//! Single-byte responses the daemon sends back to a control client.

use std::{
    convert::TryFrom,
    io::{self, Read, Write},
    os::unix::net::UnixStream,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    SuccessfulOperation,
    ListFollowing,
    NoFreePort,
    CouldNotDetermineSpeed,
    FailedToOpenFd,
    AlreadyAttached,
    NoSuchDevice,
    /// The bus-port pair was not declared in the controller configuration.
    NotAssigned,
    Invalid,
}

impl Response {
    pub fn send_over_socket(&self, socket: &mut UnixStream) -> Result<(), io::Error> {
        socket.write_all(&[*self as u8])
    }

    pub fn receive_from_socket(socket: &mut UnixStream) -> Result<Self, io::Error> {
        let mut buf = [0u8; 1];
        socket.read_exact(&mut buf)?;
        Ok(Self::try_from(buf[0]).unwrap_or(Self::Invalid))
    }

    /// Send the attached-devices list following a [`Self::ListFollowing`].
    pub fn send_device_list(
        &self,
        devices: Vec<(u8, u8)>,
        socket: &mut UnixStream,
    ) -> Result<(), io::Error> {
        assert_eq!(*self, Self::ListFollowing);

        self.send_over_socket(socket)?;
        socket.write_all(&[devices.len() as u8])?;
        for (bus, port) in devices {
            socket.write_all(&[bus, port])?;
        }
        Ok(())
    }

    pub fn receive_devices_list(
        &self,
        socket: &mut UnixStream,
    ) -> Result<Vec<(u8, u8)>, io::Error> {
        assert_eq!(*self, Self::ListFollowing);

        let mut buf = [0u8; 1];
        socket.read_exact(&mut buf)?;
        // bus and port number take one byte each.
        let len = buf[0] as usize * 2;
        let mut buf = vec![0u8; len];

        socket.read_exact(&mut buf)?;

        let mut devices = vec![];
        let mut iter = buf.into_iter();

        // iter's length is a multiple of 2, so we always get either both
        // values or none.
        while let (Some(bus), Some(port)) = (iter.next(), iter.next()) {
            devices.push((bus, port));
        }

        Ok(devices)
    }
}

impl TryFrom<u8> for Response {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::SuccessfulOperation,
            1 => Self::ListFollowing,
            2 => Self::NoFreePort,
            3 => Self::CouldNotDetermineSpeed,
            4 => Self::FailedToOpenFd,
            5 => Self::AlreadyAttached,
            6 => Self::NoSuchDevice,
            7 => Self::NotAssigned,
            _ => Self::Invalid,
        })
    }
}

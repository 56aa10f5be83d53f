//! Optional TCP channel an interactive viewer can attach to between iterations.
//!
//! Requests are a little-endian `u32` length followed by a JSON object. Replies are the
//! raw RGB8 image, if one was requested, followed by a length-prefixed verification string.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use glam::{Mat4, Vec4};
use photon_render::camera::Camera;
use serde::Deserialize;
use web_time::Duration;

/// A stalled viewer is dropped after this long.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request accepted from a viewer.
const MAX_REQUEST_BYTES: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("Viewer connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed viewer request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Viewer request of {0} bytes is too large")]
    TooLarge(u32),
    #[error("No viewer connected")]
    Closed,
}

fn flag() -> bool {
    false
}

fn unit_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViewerRequest {
    pub resolution_x: u32,
    pub resolution_y: u32,
    #[serde(default = "flag")]
    pub train: bool,
    #[serde(default)]
    pub fov_y: f32,
    #[serde(default)]
    pub fov_x: f32,
    #[serde(default)]
    pub z_near: f32,
    #[serde(default)]
    pub z_far: f32,
    #[serde(default = "flag")]
    pub shs_python: bool,
    #[serde(default = "flag")]
    pub rot_scale_python: bool,
    #[serde(default = "flag")]
    pub keep_alive: bool,
    #[serde(default = "unit_scale")]
    pub scaling_modifier: f32,
    #[serde(default)]
    pub view_matrix: Vec<f32>,
    #[serde(default)]
    pub view_projection_matrix: Vec<f32>,
}

impl ViewerRequest {
    /// The camera to render from, `None` if the viewer did not ask for an image.
    pub fn camera(&self) -> Option<Camera> {
        if self.resolution_x == 0 || self.resolution_y == 0 {
            return None;
        }
        let cols: [f32; 16] = self.view_matrix.as_slice().try_into().ok()?;
        // The viewer sends an OpenGL style view, flip y and z into camera space.
        let flip = Mat4::from_diagonal(Vec4::new(1.0, -1.0, -1.0, 1.0));
        let world_view = flip * Mat4::from_cols_array(&cols);
        Some(Camera::from_world_view(
            world_view,
            self.fov_x,
            self.fov_y,
            self.resolution_x,
            self.resolution_y,
            self.z_near,
            self.z_far,
        ))
    }

    /// Whether the viewer hands control back to training.
    pub fn resumes_training(&self, training_done: bool) -> bool {
        self.train && (!training_done || !self.keep_alive)
    }
}

#[derive(Debug)]
enum ViewerState {
    Disconnected,
    Connected(TcpStream),
}

pub struct ViewerChannel {
    listener: TcpListener,
    state: ViewerState,
    verify: String,
}

impl ViewerChannel {
    /// Listens on `ip:port`. `verify` is echoed with every reply, usually the dataset path.
    pub fn bind(ip: &str, port: u16, verify: String) -> Result<Self, ViewerError> {
        let listener = TcpListener::bind((ip, port))?;
        listener.set_nonblocking(true)?;
        log::info!("Viewer listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state: ViewerState::Disconnected,
            verify,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ViewerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ViewerState::Connected(_))
    }

    pub fn disconnect(&mut self) {
        if self.is_connected() {
            log::info!("Viewer disconnected");
        }
        self.state = ViewerState::Disconnected;
    }

    /// Accepts a pending connection without blocking. Returns whether a viewer is connected.
    pub fn try_connect(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_read_timeout(Some(READ_TIMEOUT)));
                match configured {
                    Ok(()) => {
                        log::info!("Viewer connected from {addr}");
                        self.state = ViewerState::Connected(stream);
                        true
                    }
                    Err(e) => {
                        log::warn!("Failed to set up viewer connection: {e}");
                        false
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(e) => {
                log::warn!("Failed to accept viewer: {e}");
                false
            }
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, ViewerError> {
        match &mut self.state {
            ViewerState::Connected(stream) => Ok(stream),
            ViewerState::Disconnected => Err(ViewerError::Closed),
        }
    }

    pub fn receive(&mut self) -> Result<ViewerRequest, ViewerError> {
        let stream = self.stream()?;
        let mut len = [0u8; 4];
        stream.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len);
        if len > MAX_REQUEST_BYTES {
            return Err(ViewerError::TooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn send(&mut self, image: Option<&[u8]>) -> Result<(), ViewerError> {
        let verify = self.verify.clone();
        let stream = self.stream()?;
        if let Some(image) = image {
            stream.write_all(image)?;
        }
        stream.write_all(&(verify.len() as u32).to_le_bytes())?;
        stream.write_all(verify.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    /// Serves requests until the viewer hands control back to training.
    ///
    /// `render` turns a request camera into RGB8 bytes. Any failure drops the connection
    /// and returns, so a misbehaving viewer never stops training.
    pub fn serve(&mut self, training_done: bool, mut render: impl FnMut(&ViewerRequest, &Camera) -> Vec<u8>) {
        if !self.try_connect() {
            return;
        }
        loop {
            let exchange = self.receive().and_then(|request| {
                let image = request.camera().map(|camera| render(&request, &camera));
                self.send(image.as_deref())?;
                Ok(request.resumes_training(training_done))
            });
            match exchange {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("{e}");
                    self.disconnect();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_request(stream: &mut TcpStream, json: &str) {
        stream
            .write_all(&(json.len() as u32).to_le_bytes())
            .expect("write length");
        stream.write_all(json.as_bytes()).expect("write body");
    }

    fn read_reply(stream: &mut TcpStream, image_len: usize) -> (Vec<u8>, String) {
        let mut image = vec![0u8; image_len];
        stream.read_exact(&mut image).expect("image bytes");
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).expect("verify length");
        let mut verify = vec![0u8; u32::from_le_bytes(len) as usize];
        stream.read_exact(&mut verify).expect("verify bytes");
        (image, String::from_utf8(verify).expect("ascii"))
    }

    fn channel() -> (ViewerChannel, TcpStream) {
        let mut channel = ViewerChannel::bind("127.0.0.1", 0, "data/lego".to_owned()).expect("bind");
        let addr = channel.local_addr().expect("address");
        let client = TcpStream::connect(addr).expect("connect");
        // The listener is non-blocking, so wait for the connection to be accepted.
        for _ in 0..200 {
            if channel.try_connect() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(channel.is_connected(), "Viewer should connect");
        (channel, client)
    }

    #[test]
    fn empty_request_has_no_camera() {
        let request: ViewerRequest =
            serde_json::from_str(r#"{"resolution_x": 0, "resolution_y": 0, "train": true}"#)
                .expect("valid json");
        assert!(request.camera().is_none());
        assert!(request.resumes_training(false));
        assert!(request.resumes_training(true));
    }

    #[test]
    fn keep_alive_holds_finished_training() {
        let request: ViewerRequest = serde_json::from_str(
            r#"{"resolution_x": 0, "resolution_y": 0, "train": true, "keep_alive": true}"#,
        )
        .expect("valid json");
        assert!(request.resumes_training(false));
        assert!(!request.resumes_training(true));
    }

    #[test]
    fn view_matrix_is_flipped_into_camera_space() {
        let mut view = Mat4::IDENTITY.to_cols_array().to_vec();
        // Translation of 2 along z in the viewer convention.
        view[14] = 2.0;
        let request = ViewerRequest {
            resolution_x: 8,
            resolution_y: 6,
            train: false,
            fov_y: 0.7,
            fov_x: 0.9,
            z_near: 0.01,
            z_far: 100.0,
            shs_python: false,
            rot_scale_python: false,
            keep_alive: false,
            scaling_modifier: 1.0,
            view_matrix: view,
            view_projection_matrix: vec![],
        };
        let camera = request.camera().expect("render requested");
        assert_eq!((camera.width, camera.height), (8, 6));
        let w2c = camera.world_view_transform();
        assert!(w2c.w_axis.truncate().abs_diff_eq(glam::Vec3::new(0.0, 0.0, -2.0), 1e-6));
        assert!(w2c.y_axis.truncate().abs_diff_eq(glam::Vec3::new(0.0, -1.0, 0.0), 1e-6));
    }

    #[test]
    fn serves_until_viewer_resumes_training() {
        let (mut channel, mut client) = channel();
        let view: Vec<String> = Mat4::IDENTITY
            .to_cols_array()
            .iter()
            .map(|v| v.to_string())
            .collect();
        let render_request = format!(
            r#"{{"resolution_x": 2, "resolution_y": 1, "train": false, "fov_x": 0.5, "fov_y": 0.5, "z_near": 0.01, "z_far": 10.0, "view_matrix": [{}]}}"#,
            view.join(",")
        );
        write_request(&mut client, &render_request);
        write_request(&mut client, r#"{"resolution_x": 0, "resolution_y": 0, "train": true}"#);

        let mut renders = 0;
        channel.serve(false, |_, camera| {
            renders += 1;
            vec![7; (camera.width * camera.height * 3) as usize]
        });
        assert_eq!(renders, 1);
        assert!(channel.is_connected());

        let (image, verify) = read_reply(&mut client, 6);
        assert_eq!(image, vec![7; 6]);
        assert_eq!(verify, "data/lego");
        let (_, verify) = read_reply(&mut client, 0);
        assert_eq!(verify, "data/lego");
    }

    #[test]
    fn malformed_request_disconnects() {
        let (mut channel, mut client) = channel();
        write_request(&mut client, "not json");
        channel.serve(false, |_, _| vec![]);
        assert!(!channel.is_connected());
        assert!(matches!(channel.receive(), Err(ViewerError::Closed)));
    }

    #[test]
    fn dropped_viewer_disconnects() {
        let (mut channel, client) = channel();
        drop(client);
        channel.serve(false, |_, _| vec![]);
        assert!(!channel.is_connected());
    }
}

use crate::config::CameraConfig;
use glam::{Mat4, Quat, Vec2, Vec3};
use std::str::FromStr;

const DEFAULT_UP: Vec3 = Vec3::Y;
const RESET_AZIMUTH_DEGREES: f32 = 45.0;
const RESET_ELEVATION_DEGREES: f32 = 30.0;
const MIN_FIT_FACTOR: f32 = 1.2;

/// Framebuffer size in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f32 {
        if self.height > 0 {
            self.width as f32 / self.height as f32
        } else {
            1.0
        }
    }
}

/// Perspective camera used to frame a loaded model.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y_radians: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self { position, target, up: DEFAULT_UP, fov_y_radians, near, far }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh_gl(self.fov_y_radians, aspect.max(0.0001), self.near, self.far)
    }

    pub fn view_projection(&self, viewport: Viewport) -> Mat4 {
        self.projection_matrix(viewport.aspect()) * self.view_matrix()
    }
}

/// Orbit-style controller storing yaw/pitch around a target.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub radius: f32,
    pub yaw_radians: f32,
    pub pitch_radians: f32,
}

impl OrbitCamera {
    pub fn new(target: Vec3, radius: f32) -> Self {
        Self { target, radius: radius.max(0.01), yaw_radians: 0.0, pitch_radians: 0.0 }
    }

    /// Orbit state that reproduces `position` when converted back.
    pub fn from_position(target: Vec3, position: Vec3) -> Self {
        let offset = position - target;
        let radius = offset.length();
        if radius <= f32::EPSILON {
            return Self::new(target, radius);
        }
        let mut orbit = Self::new(target, radius);
        orbit.yaw_radians = offset.x.atan2(offset.z);
        orbit.pitch_radians = (-offset.y / radius).clamp(-1.0, 1.0).asin();
        orbit
    }

    pub fn position(&self) -> Vec3 {
        let rotation = Quat::from_euler(glam::EulerRot::YXZ, self.yaw_radians, self.pitch_radians, 0.0);
        self.target + rotation * Vec3::new(0.0, 0.0, self.radius)
    }

    pub fn to_camera(&self, fov_y_radians: f32, near: f32, far: f32) -> Camera3D {
        Camera3D::new(self.position(), self.target, fov_y_radians, near, far)
    }

    pub fn orbit(&mut self, delta: Vec2) {
        self.yaw_radians += delta.x;
        self.pitch_radians = (self.pitch_radians + delta.y)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }

    pub fn zoom(&mut self, factor: f32) {
        self.radius = (self.radius * factor).clamp(0.1, 10_000.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewCommand {
    Front,
    Back,
    Left,
    Right,
    Top,
    Bottom,
    Reset,
}

impl ViewCommand {
    pub const ALL: [ViewCommand; 7] = [
        ViewCommand::Front,
        ViewCommand::Back,
        ViewCommand::Left,
        ViewCommand::Right,
        ViewCommand::Top,
        ViewCommand::Bottom,
        ViewCommand::Reset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ViewCommand::Front => "front",
            ViewCommand::Back => "back",
            ViewCommand::Left => "left",
            ViewCommand::Right => "right",
            ViewCommand::Top => "top",
            ViewCommand::Bottom => "bottom",
            ViewCommand::Reset => "reset",
        }
    }

    /// Viewing axis and up vector of an orthogonal view.
    fn axis(self) -> Option<(Vec3, Vec3)> {
        match self {
            ViewCommand::Front => Some((Vec3::Z, Vec3::Y)),
            ViewCommand::Back => Some((Vec3::NEG_Z, Vec3::Y)),
            ViewCommand::Left => Some((Vec3::NEG_X, Vec3::Y)),
            ViewCommand::Right => Some((Vec3::X, Vec3::Y)),
            ViewCommand::Top => Some((Vec3::Y, Vec3::NEG_Z)),
            ViewCommand::Bottom => Some((Vec3::NEG_Y, Vec3::Z)),
            ViewCommand::Reset => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown view command '{0}'")]
pub struct ParseViewCommandError(String);

impl FromStr for ViewCommand {
    type Err = ParseViewCommandError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ViewCommand::ALL
            .into_iter()
            .find(|command| command.name() == value)
            .ok_or_else(|| ParseViewCommandError(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRotateSignal {
    Pause,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPlacement {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub auto_rotate: AutoRotateSignal,
}

impl CameraPlacement {
    pub fn to_camera(&self, fov_y_radians: f32, near: f32, far: f32) -> Camera3D {
        let mut camera = Camera3D::new(self.position, self.target, fov_y_radians, near, far);
        camera.up = self.up;
        camera
    }

    pub fn to_orbit(&self) -> OrbitCamera {
        OrbitCamera::from_position(self.target, self.position)
    }
}

/// Computes framing distances and named view placements for a model that has
/// been recentered at the origin.
#[derive(Debug, Clone, Copy)]
pub struct CameraFit {
    pub fov_y_radians: f32,
    pub offset_multiplier: f32,
    pub ortho_distance_factor: f32,
}

impl CameraFit {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            fov_y_radians: config.fov_y_radians(),
            offset_multiplier: config.offset_multiplier,
            ortho_distance_factor: config.ortho_distance_factor,
        }
    }

    pub fn fit_distance(&self, max_dimension: f32) -> f32 {
        fit_distance(max_dimension, self.fov_y_radians, self.offset_multiplier)
    }

    pub fn place(&self, command: ViewCommand, max_dimension: f32) -> CameraPlacement {
        match command.axis() {
            Some((axis, up)) => CameraPlacement {
                position: axis * (max_dimension * self.ortho_distance_factor),
                target: Vec3::ZERO,
                up,
                auto_rotate: AutoRotateSignal::Pause,
            },
            None => {
                let azimuth = RESET_AZIMUTH_DEGREES.to_radians();
                let elevation = RESET_ELEVATION_DEGREES.to_radians();
                let direction = Vec3::new(
                    elevation.cos() * azimuth.sin(),
                    elevation.sin(),
                    elevation.cos() * azimuth.cos(),
                );
                CameraPlacement {
                    position: direction * self.fit_distance(max_dimension),
                    target: Vec3::ZERO,
                    up: DEFAULT_UP,
                    auto_rotate: AutoRotateSignal::Resume,
                }
            }
        }
    }

    /// Near/far planes that keep a model of `max_dimension` in view from `distance`.
    pub fn clip_planes(&self, max_dimension: f32, distance: f32) -> (f32, f32) {
        let extent = max_dimension.max(0.001);
        let near = (distance - extent).max(extent * 0.001).max(0.001);
        (near, distance + extent * 2.0)
    }
}

impl Default for CameraFit {
    fn default() -> Self {
        Self::new(&CameraConfig::default())
    }
}

/// Distance at which a model of `max_dimension` fills the vertical field of
/// view, scaled by `offset_multiplier`, never closer than 1.2 × its size.
pub fn fit_distance(max_dimension: f32, fov_y_radians: f32, offset_multiplier: f32) -> f32 {
    let framed = (max_dimension / 2.0) / (fov_y_radians / 2.0).tan() * offset_multiplier;
    framed.max(max_dimension * MIN_FIT_FACTOR)
}

/// Idle turntable motion around the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoRotate {
    /// Radians per second.
    pub speed: f32,
    pub paused: bool,
}

impl AutoRotate {
    pub fn new(speed: f32) -> Self {
        Self { speed, paused: false }
    }

    pub fn from_config(config: &CameraConfig) -> Self {
        Self::new(config.auto_rotate_speed)
    }

    pub fn apply(&mut self, signal: AutoRotateSignal) {
        self.paused = matches!(signal, AutoRotateSignal::Pause);
    }

    pub fn tick(&self, orbit: &mut OrbitCamera, dt_seconds: f32) {
        if !self.paused {
            orbit.yaw_radians += self.speed * dt_seconds;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera3d_view_projection_is_finite() {
        let camera = Camera3D::new(Vec3::new(0.0, 1.0, 5.0), Vec3::ZERO, 60.0_f32.to_radians(), 0.1, 1000.0);
        let vp = camera.view_projection(Viewport::new(1280, 720));
        assert!(!vp.to_cols_array().iter().any(|v| v.is_nan() || v.is_infinite()));
    }

    #[test]
    fn orbit_camera_orbits_target() {
        let mut orbit = OrbitCamera::new(Vec3::ZERO, 5.0);
        orbit.orbit(Vec2::new(0.5, 0.25));
        let camera = orbit.to_camera(45.0f32.to_radians(), 0.1, 500.0);
        assert!((camera.position.distance(Vec3::ZERO) - 5.0).abs() < 1e-4);
    }

    #[test]
    fn fit_distance_uses_fov_and_floor() {
        let fov = 45.0f32.to_radians();
        let expected = 1.0 / (fov / 2.0).tan() * 1.5;
        assert!((fit_distance(2.0, fov, 1.5) - expected).abs() < 1e-5);
        // A very wide lens would come closer than the floor allows.
        assert!((fit_distance(2.0, 170.0f32.to_radians(), 1.0) - 2.4).abs() < 1e-5);
        assert_eq!(fit_distance(0.0, fov, 1.5), 0.0);
    }

    #[test]
    fn orthogonal_views_look_at_origin_and_pause() {
        let fit = CameraFit::default();
        for command in [ViewCommand::Front, ViewCommand::Back, ViewCommand::Left, ViewCommand::Right] {
            let placement = fit.place(command, 3.0);
            assert!((placement.position.length() - 6.0).abs() < 1e-5, "{command:?}");
            assert_eq!(placement.target, Vec3::ZERO);
            assert_eq!(placement.up, Vec3::Y);
            assert_eq!(placement.auto_rotate, AutoRotateSignal::Pause);
        }
        let top = fit.place(ViewCommand::Top, 3.0);
        assert_eq!(top.position, Vec3::new(0.0, 6.0, 0.0));
        assert_eq!(top.up, Vec3::NEG_Z);
        assert_eq!(fit.place(ViewCommand::Bottom, 3.0).up, Vec3::Z);
        let view = top.to_camera(fit.fov_y_radians, 0.1, 100.0).view_matrix();
        assert!(!view.to_cols_array().iter().any(|v| v.is_nan()));
    }

    #[test]
    fn reset_frames_at_fit_distance_and_resumes() {
        let fit = CameraFit::default();
        let placement = fit.place(ViewCommand::Reset, 4.0);
        assert!((placement.position.length() - fit.fit_distance(4.0)).abs() < 1e-4);
        let elevation = (placement.position.y / placement.position.length()).asin().to_degrees();
        let azimuth = placement.position.x.atan2(placement.position.z).to_degrees();
        assert!((elevation - 30.0).abs() < 1e-3);
        assert!((azimuth - 45.0).abs() < 1e-3);
        assert_eq!(placement.auto_rotate, AutoRotateSignal::Resume);
        assert!((placement.to_orbit().position() - placement.position).length() < 1e-4);
    }

    #[test]
    fn view_commands_parse_from_lowercase_names() {
        for command in ViewCommand::ALL {
            assert_eq!(command.name().parse::<ViewCommand>(), Ok(command));
        }
        assert!("Front".parse::<ViewCommand>().is_err());
    }

    #[test]
    fn auto_rotate_follows_signals() {
        let mut spin = AutoRotate::new(0.5);
        let mut orbit = OrbitCamera::new(Vec3::ZERO, 5.0);
        spin.tick(&mut orbit, 2.0);
        assert!((orbit.yaw_radians - 1.0).abs() < 1e-6);
        spin.apply(AutoRotateSignal::Pause);
        spin.tick(&mut orbit, 2.0);
        assert!((orbit.yaw_radians - 1.0).abs() < 1e-6);
        spin.apply(AutoRotateSignal::Resume);
        assert!(!spin.paused);
    }
}

//! Device Registry for Runtime Hardware Management
//!
//! Central registry that exposes every configured device as one of the capability roles the
//! experiment engine depends on. The registry is an explicitly constructed object owned by the
//! application root and passed by reference (or `Arc`) into the builder and the engine; there is
//! no process-wide instance.
//!
//! - **DriverType**: concrete implementation selected per device at configuration load
//! - **DeviceRegistry**: lookup by role (`get_camera`, `get_light`, `get_stage`, `get_armable`)
//! - **Capability Introspection**: `list_devices`, `devices_with_capability`
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      DeviceRegistry                           │
//! │  cam_a (Camera)   laser_488 (LightSource)   stage_z (Stage)   │
//! │                  timing executor (TimingExecutor)             │
//! ├───────────────────────────────────────────────────────────────┤
//! │   Armable | Camera | LightSource | StageAxis | TimingExecutor │
//! ├───────────────────────────────────────────────────────────────┤
//! │   MockCamera | MockLight | MockStage | MockExecutor           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let events = EventBus::default();
//! let registry = DeviceRegistry::from_config(&config, &events).await?;
//!
//! for info in registry.list_devices() {
//!     println!("{}: {} ({:?})", info.id, info.name, info.capabilities);
//! }
//!
//! if let Some(stage) = registry.get_stage("stage_z") {
//!     stage.move_abs(10.0).await?;
//! }
//! ```

use crate::config::{DeviceDefinition, ScopeConfig};
use crate::events::EventBus;
use crate::hardware::capabilities::{Armable, Camera, LightSource, StageAxis, TimingExecutor};
use crate::hardware::mock::{
    LineBus, MockCamera, MockCameraConfig, MockExecutor, MockLight, MockLightConfig, MockStage,
    MockStageConfig,
};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Device Identification
// =============================================================================

/// Unique identifier for a registered device
///
/// Format: lowercase alphanumeric with underscores (e.g., "cam_a", "laser_488")
pub type DeviceId = String;

/// Capability roles a device can fill (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Can be armed for hardware triggering
    Armable,
    /// Produces frames on trigger edges
    Camera,
    /// Emits light while its line is high
    LightSource,
    /// Positions along one axis from an analog line
    StageAxis,
}

// =============================================================================
// Driver Types (Configuration)
// =============================================================================

/// Driver configuration for instantiating hardware
///
/// Each variant corresponds to a driver with its required configuration.
#[derive(Debug, Clone)]
pub enum DriverType {
    /// Simulated trigger-driven camera
    MockCamera(MockCameraConfig),
    /// Simulated gated light source
    MockLight(MockLightConfig),
    /// Simulated analog-driven stage axis
    MockStage(MockStageConfig),
}

impl DriverType {
    /// Get the capabilities this driver type provides
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            DriverType::MockCamera(_) => vec![Capability::Armable, Capability::Camera],
            DriverType::MockLight(_) => vec![Capability::Armable, Capability::LightSource],
            DriverType::MockStage(_) => vec![Capability::Armable, Capability::StageAxis],
        }
    }

    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::MockCamera(_) => "mock_camera",
            DriverType::MockLight(_) => "mock_light",
            DriverType::MockStage(_) => "mock_stage",
        }
    }

    /// Select the driver named by a configuration entry and parse its settings.
    pub fn from_definition(definition: &DeviceDefinition) -> Result<Self> {
        let settings = definition.config.clone();
        let driver = match definition.r#type.as_str() {
            "mock_camera" => DriverType::MockCamera(settings.try_into()?),
            "mock_light" => DriverType::MockLight(settings.try_into()?),
            "mock_stage" => DriverType::MockStage(settings.try_into()?),
            other => return Err(anyhow!("Unknown driver type '{}'", other)),
        };
        Ok(driver)
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for registering a device
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Unique identifier (e.g., "cam_a", "stage_z")
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type and configuration
    pub driver: DriverType,
}

// =============================================================================
// Device Info (for introspection)
// =============================================================================

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Unique identifier
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type name (e.g., "mock_camera")
    pub driver_type: String,
    /// Capabilities this device supports
    pub capabilities: Vec<Capability>,
    /// Capability-specific metadata
    pub metadata: DeviceMetadata,
}

/// Capability-specific metadata for a device
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// For cameras and lights: digital trigger line
    pub trigger_line: Option<u8>,
    /// For lights: shutter line
    pub shutter_line: Option<u8>,
    /// For stages: analog line
    pub analog_line: Option<u8>,
    /// For cameras: frame width in pixels
    pub frame_width: Option<u32>,
    /// For cameras: frame height in pixels
    pub frame_height: Option<u32>,
    /// For cameras: minimum exposure in milliseconds
    pub min_exposure_ms: Option<f64>,
    /// For lights: wavelength in nanometers
    pub wavelength_nm: Option<f64>,
}

// =============================================================================
// Registered Device (Internal)
// =============================================================================

struct RegisteredDevice {
    name: String,
    driver_type: String,
    capabilities: Vec<Capability>,
    armable: Arc<dyn Armable>,
    camera: Option<Arc<dyn Camera>>,
    light: Option<Arc<dyn LightSource>>,
    stage: Option<Arc<dyn StageAxis>>,
    metadata: DeviceMetadata,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Central registry for hardware device management
///
/// The DeviceRegistry is the primary interface for:
/// - Registering devices from configuration
/// - Accessing devices by role
/// - Querying device information
/// - Holding the timing executor that drives every registered device
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, RegisteredDevice>,
    executor: Option<Arc<dyn TimingExecutor>>,
    line_bus: Option<LineBus>,
    events: EventBus,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new(events: EventBus) -> Self {
        Self {
            devices: HashMap::new(),
            executor: None,
            line_bus: None,
            events,
        }
    }

    /// Build a registry from configuration: the timing executor plus every enabled device.
    ///
    /// # Errors
    /// Returns error if a device entry names an unknown driver or carries malformed settings.
    pub async fn from_config(config: &ScopeConfig, events: &EventBus) -> Result<Self> {
        let mut registry = Self::new(events.clone());
        registry.set_mock_executor(Arc::new(MockExecutor::new(&config.executor)));

        for definition in config.enabled_devices() {
            let driver = DriverType::from_definition(definition)
                .with_context(|| format!("Invalid configuration for device '{}'", definition.id))?;
            registry
                .register(DeviceConfig {
                    id: definition.id.clone(),
                    name: definition.id.clone(),
                    driver,
                })
                .await?;
        }

        info!(devices = registry.len(), "Device registry ready");
        Ok(registry)
    }

    /// Install a timing executor.
    pub fn set_executor(&mut self, executor: Arc<dyn TimingExecutor>) {
        self.executor = Some(executor);
    }

    /// Install a simulated executor; simulated devices registered afterwards listen to its lines.
    pub fn set_mock_executor(&mut self, executor: Arc<MockExecutor>) {
        self.line_bus = Some(executor.line_bus());
        self.executor = Some(executor);
    }

    /// The timing executor, if one is installed
    pub fn executor(&self) -> Option<Arc<dyn TimingExecutor>> {
        self.executor.clone()
    }

    /// Event channels shared with the devices
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a device from configuration
    ///
    /// # Errors
    /// Returns error if:
    /// - Device ID is already registered
    /// - A simulated driver is requested before a simulated executor is installed
    pub async fn register(&mut self, config: DeviceConfig) -> Result<()> {
        if self.devices.contains_key(&config.id) {
            return Err(anyhow!("Device '{}' is already registered", config.id));
        }
        let bus = self.line_bus.clone().ok_or_else(|| {
            anyhow!(
                "Driver '{}' for '{}' needs a simulated executor",
                config.driver.driver_name(),
                config.id
            )
        })?;

        match config.driver {
            DriverType::MockCamera(settings) => {
                let camera = Arc::new(MockCamera::from_config(&config.id, &settings, bus));
                self.insert_camera(config.id, config.name, "mock_camera", camera)
            }
            DriverType::MockLight(settings) => {
                let light = Arc::new(MockLight::from_config(&config.id, &settings, bus));
                self.insert_light(config.id, config.name, "mock_light", light)
            }
            DriverType::MockStage(settings) => {
                let stage = Arc::new(
                    MockStage::from_config(&config.id, &settings, bus)
                        .with_events(self.events.clone()),
                );
                self.insert_stage(config.id, config.name, "mock_stage", stage)
            }
        }
    }

    /// Register an already constructed camera
    pub fn register_camera<C: Camera + 'static>(&mut self, id: &str, camera: Arc<C>) -> Result<()> {
        self.ensure_free(id)?;
        self.insert_camera(id.to_string(), id.to_string(), "custom", camera)
    }

    /// Register an already constructed light source
    pub fn register_light<L: LightSource + 'static>(&mut self, id: &str, light: Arc<L>) -> Result<()> {
        self.ensure_free(id)?;
        self.insert_light(id.to_string(), id.to_string(), "custom", light)
    }

    /// Register an already constructed stage axis
    pub fn register_stage<S: StageAxis + 'static>(&mut self, id: &str, stage: Arc<S>) -> Result<()> {
        self.ensure_free(id)?;
        self.insert_stage(id.to_string(), id.to_string(), "custom", stage)
    }

    /// Unregister a device
    ///
    /// # Returns
    /// true if device was found and removed, false if not found
    pub fn unregister(&mut self, id: &str) -> bool {
        self.devices.remove(id).is_some()
    }

    /// List all registered devices, sorted by id
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .devices
            .iter()
            .map(|(id, d)| Self::info(id, d))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Get device info by ID
    pub fn get_device_info(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.get(id).map(|d| Self::info(id, d))
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Get a device as Armable (every registered device is)
    pub fn get_armable(&self, id: &str) -> Option<Arc<dyn Armable>> {
        self.devices.get(id).map(|d| d.armable.clone())
    }

    /// Get a device as Camera (if it fills this role)
    pub fn get_camera(&self, id: &str) -> Option<Arc<dyn Camera>> {
        self.devices.get(id).and_then(|d| d.camera.clone())
    }

    /// Get a device as LightSource (if it fills this role)
    pub fn get_light(&self, id: &str) -> Option<Arc<dyn LightSource>> {
        self.devices.get(id).and_then(|d| d.light.clone())
    }

    /// Get a device as StageAxis (if it fills this role)
    pub fn get_stage(&self, id: &str) -> Option<Arc<dyn StageAxis>> {
        self.devices.get(id).and_then(|d| d.stage.clone())
    }

    /// Get all devices that support a specific capability, sorted by id
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, d)| d.capabilities.contains(&capability))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Registration (Private)
    // =========================================================================

    fn ensure_free(&self, id: &str) -> Result<()> {
        if self.devices.contains_key(id) {
            return Err(anyhow!("Device '{}' is already registered", id));
        }
        Ok(())
    }

    fn info(id: &str, device: &RegisteredDevice) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: device.name.clone(),
            driver_type: device.driver_type.clone(),
            capabilities: device.capabilities.clone(),
            metadata: device.metadata.clone(),
        }
    }

    fn insert_camera<C: Camera + 'static>(
        &mut self,
        id: DeviceId,
        name: String,
        driver_type: &str,
        camera: Arc<C>,
    ) -> Result<()> {
        let (width, height) = camera.resolution();
        let metadata = DeviceMetadata {
            trigger_line: Some(camera.trigger_line().0),
            frame_width: Some(width),
            frame_height: Some(height),
            min_exposure_ms: Some(camera.min_exposure().as_secs_f64() * 1e3),
            ..Default::default()
        };
        debug!(device = %id, line = camera.trigger_line().0, "Registered camera");
        self.devices.insert(
            id,
            RegisteredDevice {
                name,
                driver_type: driver_type.to_string(),
                capabilities: vec![Capability::Armable, Capability::Camera],
                armable: camera.clone(),
                camera: Some(camera),
                light: None,
                stage: None,
                metadata,
            },
        );
        Ok(())
    }

    fn insert_light<L: LightSource + 'static>(
        &mut self,
        id: DeviceId,
        name: String,
        driver_type: &str,
        light: Arc<L>,
    ) -> Result<()> {
        let metadata = DeviceMetadata {
            trigger_line: Some(light.trigger_line().0),
            shutter_line: light.shutter_line().map(|l| l.0),
            wavelength_nm: Some(light.wavelength_nm()),
            ..Default::default()
        };
        debug!(device = %id, line = light.trigger_line().0, "Registered light source");
        self.devices.insert(
            id,
            RegisteredDevice {
                name,
                driver_type: driver_type.to_string(),
                capabilities: vec![Capability::Armable, Capability::LightSource],
                armable: light.clone(),
                camera: None,
                light: Some(light),
                stage: None,
                metadata,
            },
        );
        Ok(())
    }

    fn insert_stage<S: StageAxis + 'static>(
        &mut self,
        id: DeviceId,
        name: String,
        driver_type: &str,
        stage: Arc<S>,
    ) -> Result<()> {
        let metadata = DeviceMetadata {
            analog_line: Some(stage.analog_line().line),
            ..Default::default()
        };
        debug!(device = %id, line = stage.analog_line().line, "Registered stage axis");
        self.devices.insert(
            id,
            RegisteredDevice {
                name,
                driver_type: driver_type.to_string(),
                capabilities: vec![Capability::Armable, Capability::StageAxis],
                armable: stage.clone(),
                camera: None,
                light: None,
                stage: Some(stage),
                metadata,
            },
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [[devices]]
        id = "cam_a"
        type = "mock_camera"
        config = { line = 0, min_exposure = "1ms", width = 8, height = 4 }

        [[devices]]
        id = "laser_488"
        type = "mock_light"
        config = { line = 1, shutter_line = 2, wavelength_nm = 488.0 }

        [[devices]]
        id = "stage_z"
        type = "mock_stage"
        config = { line = 0, gain = 0.1 }

        [[devices]]
        id = "spare"
        type = "mock_camera"
        enabled = false
    "#;

    async fn registry() -> DeviceRegistry {
        let config = ScopeConfig::from_toml_str(CONFIG).unwrap();
        DeviceRegistry::from_config(&config, &EventBus::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_from_config_registers_enabled_devices() {
        let registry = registry().await;
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("cam_a"));
        assert!(!registry.contains("spare"));
        assert!(registry.executor().is_some());
    }

    #[tokio::test]
    async fn test_list_devices() {
        let registry = registry().await;
        let devices = registry.list_devices();

        let cam = devices.iter().find(|d| d.id == "cam_a").unwrap();
        assert_eq!(cam.driver_type, "mock_camera");
        assert!(cam.capabilities.contains(&Capability::Camera));
        assert_eq!(cam.metadata.frame_width, Some(8));

        let laser = devices.iter().find(|d| d.id == "laser_488").unwrap();
        assert_eq!(laser.metadata.shutter_line, Some(2));
        assert_eq!(laser.metadata.wavelength_nm, Some(488.0));
    }

    #[tokio::test]
    async fn test_role_lookup() {
        let registry = registry().await;
        assert!(registry.get_camera("cam_a").is_some());
        assert!(registry.get_camera("stage_z").is_none());
        assert!(registry.get_light("laser_488").is_some());
        assert!(registry.get_stage("stage_z").is_some());
        assert!(registry.get_armable("stage_z").is_some());
        assert!(registry.get_armable("missing").is_none());
        assert_eq!(
            registry.devices_with_capability(Capability::Armable),
            vec!["cam_a", "laser_488", "stage_z"]
        );
    }

    #[tokio::test]
    async fn test_unknown_driver_rejected() {
        let config = ScopeConfig::from_toml_str(
            r#"
            [[devices]]
            id = "pmt"
            type = "photomultiplier"
            "#,
        )
        .unwrap();
        let result = DeviceRegistry::from_config(&config, &EventBus::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let mut registry = registry().await;
        let result = registry
            .register(DeviceConfig {
                id: "cam_a".into(),
                name: "Duplicate".into(),
                driver: DriverType::MockCamera(MockCameraConfig::default()),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_driver_needs_executor() {
        let mut registry = DeviceRegistry::new(EventBus::default());
        let result = registry
            .register(DeviceConfig {
                id: "cam_a".into(),
                name: "Camera".into(),
                driver: DriverType::MockCamera(MockCameraConfig::default()),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let mut registry = registry().await;
        assert!(registry.unregister("cam_a"));
        assert!(!registry.contains("cam_a"));
        assert!(!registry.unregister("cam_a"));
    }

    #[tokio::test]
    async fn test_capability_access() {
        let registry = registry().await;
        let stage = registry.get_stage("stage_z").unwrap();
        stage.move_abs(10.0).await.unwrap();
        let pos = stage.position().await.unwrap();
        assert!((pos - 10.0).abs() < 0.001);
    }
}

//
// beaverctl - Lunatico Beaver observatory dome controller driver
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Configuration file.
//!

use crate::dome::RainAction;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "beaverctl.toml";

#[derive(Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct Settings {
    /// Serial device of the controller, e.g. "/dev/ttyUSB0" or "COM3".
    device: Option<String>,
    home_on_park: bool,
    home_on_unpark: bool,
    rain_action: Option<RainAction>,
    /// File the rain state is persisted to for other programs to watch.
    rain_status_file: Option<PathBuf>
}

pub struct Configuration {
    file_path: Option<PathBuf>,
    settings: Settings
}

impl Configuration {
    pub fn load() -> Configuration {
        let file_path = dirs::config_dir().map(|dir| dir.join(CONFIG_FILE_NAME));

        let settings = match &file_path {
            Some(path) if path.exists() => match Configuration::read(path) {
                Ok(settings) => settings,
                Err(message) => {
                    println!("WARNING: {}", message);
                    Default::default()
                }
            },
            _ => Default::default()
        };

        Configuration{ file_path, settings }
    }

    fn read(path: &PathBuf) -> Result<Settings, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read configuration file {}: {}", path.display(), e))?;
        toml::from_str(&contents)
            .map_err(|e| format!("failed to parse configuration file {}: {}", path.display(), e))
    }

    pub fn store(&self) -> Result<(), std::io::Error> {
        let path = match &self.file_path {
            Some(path) => path,
            None => return Ok(())
        };
        let contents = toml::to_string_pretty(&self.settings)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, contents)
    }

    pub fn device(&self) -> Option<String> {
        self.settings.device.clone()
    }

    pub fn set_device(&mut self, device: &str) {
        self.settings.device = Some(device.to_string());
    }

    pub fn home_on_park(&self) -> bool {
        self.settings.home_on_park
    }

    pub fn home_on_unpark(&self) -> bool {
        self.settings.home_on_unpark
    }

    pub fn rain_action(&self) -> RainAction {
        self.settings.rain_action.unwrap_or(RainAction::DoNothing)
    }

    pub fn rain_status_file(&self) -> Option<PathBuf> {
        self.settings.rain_status_file.clone()
    }
}

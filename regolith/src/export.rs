//! Scene export: Wavefront OBJ interchange file, then external converters.
//!
//! The default chain is `obj2gltf` (OBJ → glTF) followed by `gltf-pipeline`
//! with Draco compression (glTF → GLB). Each step is an [`ExportStep`] run
//! with a timeout. Intermediates live in a scratch directory next to the
//! destination, and the GLB is only moved into place after its header
//! checks out.
//!
//! # Example
//!
//! ```ignore
//! use regolith::{convert, ExportConfig, MeshConfig, SceneExporter};
//!
//! let output = convert(&tile, &MeshConfig::default())?;
//! SceneExporter::new(&ExportConfig::default()).export(&output.mesh, "lat-30_lon000.glb".as_ref())?;
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use wait_timeout::ChildExt;

use crate::error::{RegolithError, Result};
use crate::mesh::TerrainMesh;
use crate::report::write_atomic;

/// GLB container magic.
pub const GLB_MAGIC: &[u8; 4] = b"glTF";

/// Supported GLB container version.
pub const GLB_VERSION: u32 = 2;

/// Export tool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    /// Wall-clock limit for each external step.
    pub timeout_secs: u64,
    pub obj2gltf_program: String,
    pub gltf_pipeline_program: String,
    pub draco_compression_level: u8,
    pub draco_position_bits: u8,
    pub draco_normal_bits: u8,
    pub draco_texcoord_bits: u8,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            obj2gltf_program: "obj2gltf".to_string(),
            gltf_pipeline_program: "gltf-pipeline".to_string(),
            draco_compression_level: 7,
            draco_position_bits: 14,
            draco_normal_bits: 10,
            draco_texcoord_bits: 12,
        }
    }
}

impl ExportConfig {
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_programs(
        mut self,
        obj2gltf: impl Into<String>,
        gltf_pipeline: impl Into<String>,
    ) -> Self {
        self.obj2gltf_program = obj2gltf.into();
        self.gltf_pipeline_program = gltf_pipeline.into();
        self
    }

    pub fn with_draco_compression_level(mut self, level: u8) -> Self {
        self.draco_compression_level = level;
        self
    }
}

/// One file-to-file conversion in the export chain.
pub trait ExportStep: Send + Sync {
    /// Stage name reported in errors.
    fn name(&self) -> &str;

    /// Extension of the file this step produces.
    fn output_extension(&self) -> &str;

    /// Convert `input` into `output` within `timeout`.
    ///
    /// # Errors
    ///
    /// [`RegolithError::ExportFailed`] on failure and
    /// [`RegolithError::ExportTimedOut`] when the deadline passes.
    fn run(&self, input: &Path, output: &Path, timeout: Duration) -> Result<()>;
}

/// External program invoked with an argument template.
///
/// `{input}` and `{output}` in the template are replaced with the step's
/// paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    name: String,
    program: String,
    args: Vec<String>,
    extension: String,
}

impl CommandStep {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: vec![
                "-i".to_string(),
                "{input}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
            ],
            extension: extension.into(),
        }
    }

    /// Replace the argument template.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// OBJ → glTF.
    pub fn obj2gltf(config: &ExportConfig) -> Self {
        Self::new("obj2gltf", &config.obj2gltf_program, "gltf")
    }

    /// glTF → Draco-compressed GLB.
    pub fn gltf_pipeline(config: &ExportConfig) -> Self {
        Self::new("gltf-pipeline", &config.gltf_pipeline_program, "glb").with_args([
            "-i".to_string(),
            "{input}".to_string(),
            "-o".to_string(),
            "{output}".to_string(),
            "--draco.compressionLevel".to_string(),
            config.draco_compression_level.to_string(),
            "--draco.quantizePositionBits".to_string(),
            config.draco_position_bits.to_string(),
            "--draco.quantizeNormalBits".to_string(),
            config.draco_normal_bits.to_string(),
            "--draco.quantizeTexcoordBits".to_string(),
            config.draco_texcoord_bits.to_string(),
        ])
    }

    fn expand_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.display().to_string();
        let output = output.display().to_string();
        self.args
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }

    fn failed(&self, reason: impl Into<String>) -> RegolithError {
        RegolithError::ExportFailed {
            stage: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl ExportStep for CommandStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_extension(&self) -> &str {
        &self.extension
    }

    fn run(&self, input: &Path, output: &Path, timeout: Duration) -> Result<()> {
        let args = self.expand_args(input, output);
        debug!(stage = %self.name, program = %self.program, ?args, "running export step");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.failed(format!("cannot start '{}': {}", self.program, e)))?;

        // Drain stderr so a chatty tool never blocks on a full pipe
        let stderr = child.stderr.take();
        let reader = std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text);
            }
            text
        });

        let Some(status) = child.wait_timeout(timeout)? else {
            let _ = child.kill();
            let _ = child.wait();
            // The pipe closes with the child, so the reader finishes
            let _ = reader.join();
            return Err(RegolithError::ExportTimedOut {
                stage: self.name.clone(),
                timeout_secs: timeout.as_secs(),
            });
        };

        let stderr_text = reader.join().unwrap_or_default();
        if !status.success() {
            return Err(self.failed(format!("{}: {}", status, stderr_text.trim())));
        }
        if !output.is_file() {
            return Err(self.failed(format!("no output written to {}", output.display())));
        }
        Ok(())
    }
}

/// Write `mesh` as Wavefront OBJ with vertex normals, Y-up.
///
/// Mesh `(x, y, z)` is written as `(x, z, y)` so elevation becomes the
/// vertical axis.
pub fn write_obj(mesh: &TerrainMesh, path: &Path) -> Result<()> {
    let normals = mesh.vertex_normals();
    write_atomic(path, |w| {
        writeln!(w, "# regolith terrain mesh")?;
        writeln!(
            w,
            "# {} vertices, {} faces",
            mesh.vertex_count(),
            mesh.face_count()
        )?;
        for v in &mesh.vertices {
            writeln!(w, "v {:.6} {:.6} {:.6}", v[0], v[2], v[1])?;
        }
        for n in &normals {
            writeln!(w, "vn {:.6} {:.6} {:.6}", n[0], n[2], n[1])?;
        }
        for f in &mesh.faces {
            let [a, b, c] = f.map(|i| i + 1);
            writeln!(w, "f {a}//{a} {b}//{b} {c}//{c}")?;
        }
        Ok(())
    })
}

/// Check the GLB header: magic `glTF`, little-endian version 2.
pub fn validate_glb(path: &Path) -> Result<()> {
    let invalid = |reason: String| RegolithError::ExportFailed {
        stage: "validate".to_string(),
        reason,
    };

    let mut header = [0u8; 12];
    File::open(path)?
        .read_exact(&mut header)
        .map_err(|_| invalid(format!("{} is shorter than a GLB header", path.display())))?;

    if &header[0..4] != GLB_MAGIC {
        return Err(invalid(format!("{} lacks the glTF magic", path.display())));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != GLB_VERSION {
        return Err(invalid(format!(
            "{} is GLB version {}, expected {}",
            path.display(),
            version,
            GLB_VERSION
        )));
    }
    Ok(())
}

/// Runs the export chain for one mesh.
pub struct SceneExporter {
    steps: Vec<Box<dyn ExportStep>>,
    timeout: Duration,
}

impl SceneExporter {
    /// The default `obj2gltf` → `gltf-pipeline` chain.
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            steps: vec![
                Box::new(CommandStep::obj2gltf(config)),
                Box::new(CommandStep::gltf_pipeline(config)),
            ],
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// A custom chain. The last step must produce GLB.
    pub fn with_steps(steps: Vec<Box<dyn ExportStep>>, timeout: Duration) -> Self {
        Self { steps, timeout }
    }

    /// Names of the configured steps, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Export `mesh` to the GLB file at `output`.
    ///
    /// Either `output` ends up holding a validated GLB, or it is left as it
    /// was. Intermediate files are always removed.
    pub fn export(&self, mesh: &TerrainMesh, output: &Path) -> Result<()> {
        let start = Instant::now();
        let dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(".regolith-export")
            .tempdir_in(&dir)?;

        let mut current = scratch.path().join("scene.obj");
        write_obj(mesh, &current)?;
        debug!(path = %current.display(), "interchange file written");

        for (i, step) in self.steps.iter().enumerate() {
            let next = scratch
                .path()
                .join(format!("scene.{}.{}", i, step.output_extension()));
            step.run(&current, &next, self.timeout)?;
            current = next;
        }

        validate_glb(&current)?;
        std::fs::rename(&current, output)?;

        info!(
            output = %output.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "scene exported"
        );
        Ok(())
    }
}

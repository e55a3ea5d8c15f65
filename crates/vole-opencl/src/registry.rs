use ocl::Program;

use vole_core::{Error, Result};

use crate::SessionCache;

// Kernel registry — Lazy, cached compilation of kernel programs
//
// Each operation's kernels live in `<kernel_dir>/<op>.cl`, declaring one
// entry point per dtype family and variant (`add_fp`, `add_c_int`, ...).
// Programs are built on first use against the session's context and cached
// for its lifetime. A failed build surfaces the device's build log.

impl SessionCache {
    /// The compiled program for an operation, building it on first use.
    pub fn program(&self, op: &str) -> Result<Program> {
        if let Some(program) = self.cached_program(op) {
            return Ok(program);
        }
        let path = self.kernel_dir().join(format!("{}.cl", op));
        let src = std::fs::read_to_string(&path).map_err(|e| {
            Error::msg(format!(
                "kernel source '{}' unreadable: {}",
                path.display(),
                e
            ))
        })?;
        log::debug!("building kernel program '{}' from {}", op, path.display());
        let program = Program::builder()
            .devices(self.device().clone())
            .src(src)
            .build(self.context())
            .map_err(|e| Error::KernelBuildFailure {
                op: op.to_string(),
                log: e.to_string(),
            })?;
        self.store_program(op, program.clone());
        Ok(program)
    }
}

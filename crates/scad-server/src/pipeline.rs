use std::future::Future;

use scad_ai::{ApiKey, LanguageModel, ScriptGenerator};
use scad_compiler::ScadCompiler;

use crate::session::{Failure, InvalidTransition, RequestRecord, RequestState};

/// Drives one prompt through generation and compilation.
///
/// Every outcome the user can act on (bad credential, model failure,
/// OpenSCAD rejecting the script) ends in a `Failed` record; the `Err` arm
/// is reserved for a broken state machine.
pub async fn run_request<M, F>(
    generator: &ScriptGenerator<M>,
    compiler: &ScadCompiler,
    prompt: &str,
    api_key: Option<&ApiKey>,
    cancel: F,
) -> Result<RequestRecord, InvalidTransition>
where
    M: LanguageModel,
    F: Future<Output = ()>,
{
    let mut record = RequestRecord::new(prompt.trim());
    record.transition(RequestState::Generating)?;

    let script = match generator.generate(prompt, api_key).await {
        Ok(script) => script,
        Err(err) => {
            tracing::warn!(request = %record.id, kind = err.kind(), "generation failed: {err}");
            record.failure = Some(Failure::from(&err));
            record.transition(RequestState::Failed)?;
            return Ok(record);
        }
    };
    record.generation_ms = Some(script.elapsed_ms);
    record.script = Some(script.source);
    record.transition(RequestState::Generated)?;

    record.transition(RequestState::Compiling)?;
    let source = record.script.as_deref().unwrap_or_default();
    match compiler.compile_until(source, cancel).await {
        Ok(mesh) => {
            record.compile_ms = Some(mesh.elapsed_ms);
            record.mesh = Some(mesh);
            record.transition(RequestState::Ready)?;
        }
        Err(err) => {
            record.failure = Some(Failure::from(&err));
            record.transition(RequestState::Failed)?;
        }
    }
    Ok(record)
}

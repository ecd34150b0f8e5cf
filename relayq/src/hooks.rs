/// A minimal transaction context handed to completion hooks.
///
/// Hooks append commands to the pipeline; everything in it executes in the
/// same MULTI/EXEC as the job's own state movement, so follow-up jobs queued
/// from a hook are atomic with the completion.
pub struct TransactionContext<'a> {
    pipeline: &'a mut redis::Pipeline,
    queue_name: String,
}

impl<'a> TransactionContext<'a> {
    pub fn new(pipeline: &'a mut redis::Pipeline, queue_name: String) -> Self {
        Self {
            pipeline,
            queue_name,
        }
    }

    pub fn pipeline(&mut self) -> &mut redis::Pipeline {
        self.pipeline
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

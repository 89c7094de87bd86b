use std::future::Future;

/// Four ordered read-path stages: skeleton, hydration, rules, presentation.
///
/// Each stage takes the previous state by value plus the shared context and
/// returns the next state. The first error stops the run and is returned as is.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline<Sk, Hy, Ru, Pr> {
    skeleton: Sk,
    hydration: Hy,
    rules: Ru,
    presentation: Pr,
}

pub fn create_pipeline<Sk, Hy, Ru, Pr>(
    skeleton: Sk,
    hydration: Hy,
    rules: Ru,
    presentation: Pr,
) -> Pipeline<Sk, Hy, Ru, Pr> {
    Pipeline { skeleton, hydration, rules, presentation }
}

impl<Sk, Hy, Ru, Pr> Pipeline<Sk, Hy, Ru, Pr> {
    /// Run all four stages in order.
    ///
    /// # Errors
    /// Returns the first error raised by any stage, unchanged.
    pub async fn run<'ctx, Params, Ctx, SkState, HyState, Output, Error, SkFut, HyFut, RuFut, PrFut>(
        &self,
        params: Params,
        ctx: &'ctx Ctx,
    ) -> Result<Output, Error>
    where
        Ctx: ?Sized,
        Sk: Fn(Params, &'ctx Ctx) -> SkFut,
        SkFut: Future<Output = Result<SkState, Error>>,
        Hy: Fn(SkState, &'ctx Ctx) -> HyFut,
        HyFut: Future<Output = Result<HyState, Error>>,
        Ru: Fn(HyState, &'ctx Ctx) -> RuFut,
        RuFut: Future<Output = Result<HyState, Error>>,
        Pr: Fn(HyState, &'ctx Ctx) -> PrFut,
        PrFut: Future<Output = Result<Output, Error>>,
    {
        let skeleton = (self.skeleton)(params, ctx).await?;
        let hydrated = (self.hydration)(skeleton, ctx).await?;
        let ruled = (self.rules)(hydrated, ctx).await?;
        (self.presentation)(ruled, ctx).await
    }
}

/// Passthrough rules stage.
///
/// # Errors
/// Never fails.
pub async fn no_rules<State, Ctx: ?Sized, Error>(state: State, _ctx: &Ctx) -> Result<State, Error> {
    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Trace {
        stages: Mutex<Vec<&'static str>>,
        fail_hydration: bool,
    }

    impl Trace {
        fn record(&self, stage: &'static str) {
            match self.stages.lock() {
                Ok(mut stages) => stages.push(stage),
                Err(err) => panic!("trace lock poisoned: {err}"),
            }
        }

        fn stages(&self) -> Vec<&'static str> {
            match self.stages.lock() {
                Ok(stages) => stages.clone(),
                Err(err) => panic!("trace lock poisoned: {err}"),
            }
        }
    }

    async fn skeleton(params: u32, ctx: &Trace) -> Result<Vec<u32>, String> {
        ctx.record("skeleton");
        Ok(vec![params])
    }

    async fn hydration(state: Vec<u32>, ctx: &Trace) -> Result<(Vec<u32>, u32), String> {
        ctx.record("hydration");
        if ctx.fail_hydration {
            return Err("hydration failed".to_string());
        }
        let total = state.iter().sum();
        Ok((state, total))
    }

    async fn double(state: (Vec<u32>, u32), ctx: &Trace) -> Result<(Vec<u32>, u32), String> {
        ctx.record("rules");
        Ok((state.0, state.1 * 2))
    }

    async fn presentation(state: (Vec<u32>, u32), ctx: &Trace) -> Result<String, String> {
        ctx.record("presentation");
        Ok(format!("{:?}={}", state.0, state.1))
    }

    // Test IDs: TPIPE-001
    #[tokio::test]
    async fn stages_run_in_order_and_thread_state() {
        let trace = Trace::default();
        let output = create_pipeline(skeleton, hydration, double, presentation).run(21, &trace).await;
        assert_eq!(output, Ok("[21]=42".to_string()));
        assert_eq!(trace.stages(), vec!["skeleton", "hydration", "rules", "presentation"]);
    }

    // Test IDs: TPIPE-002
    #[tokio::test]
    async fn first_failure_short_circuits() {
        let trace = Trace { fail_hydration: true, ..Trace::default() };
        let output = create_pipeline(skeleton, hydration, double, presentation).run(1, &trace).await;
        assert_eq!(output, Err("hydration failed".to_string()));
        assert_eq!(trace.stages(), vec!["skeleton", "hydration"]);
    }

    // Test IDs: TPIPE-003
    #[tokio::test]
    async fn no_rules_passes_state_through() {
        let trace = Trace::default();
        let output = create_pipeline(skeleton, hydration, no_rules, presentation).run(7, &trace).await;
        assert_eq!(output, Ok("[7]=7".to_string()));
        assert_eq!(trace.stages(), vec!["skeleton", "hydration", "presentation"]);
    }
}

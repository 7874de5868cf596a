use futures::{StreamExt, future};
use tokio_stream::wrappers::IntervalStream;
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::{AgentContext, reject, with_context};

pub fn events_route(ctx: AgentContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("jobs" / Uuid / "events")
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_events)
}

/// Streams the job's status once per scheduler tick, ending after the first
/// terminal status or once the job has been deleted.
async fn handle_events(job_id: Uuid, ctx: AgentContext) -> Result<impl Reply, Rejection> {
  ctx.scheduler.status(job_id).await.map_err(reject)?;

  let scheduler = ctx.scheduler.clone();
  let interval = IntervalStream::new(tokio::time::interval(scheduler.limits().tick_interval));
  let stream = interval
    .then(move |_| {
      let scheduler = scheduler.clone();
      async move { scheduler.status(job_id).await }
    })
    .scan(false, |finished, status| {
      if *finished {
        return future::ready(None);
      }
      let event = match status {
        Ok(view) => {
          *finished = view.status.is_terminal();
          Event::default().event("status").json_data(&view)
        }
        Err(e) => {
          *finished = true;
          Ok(Event::default().event("gone").data(e.to_string()))
        }
      };
      future::ready(Some(event))
    });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}

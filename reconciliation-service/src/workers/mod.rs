mod batch_worker;

pub use batch_worker::{
    requeue_unfinished, BatchJob, BatchQueue, BatchRunner, BatchWorker, WORKER_SOURCE,
};

mod cron;
mod jobs;
mod pipes;
mod process_table;
mod queues;
mod shared_memory;
mod signals;
mod syscalls;

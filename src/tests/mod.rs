
mod test_execution;
mod test_runner;
mod test_workload;

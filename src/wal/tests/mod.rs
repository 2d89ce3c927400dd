mod tests_log;
mod tests_recovery;

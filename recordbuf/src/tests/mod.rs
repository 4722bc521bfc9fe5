mod concurrent_tests;
mod torn_read_tests;

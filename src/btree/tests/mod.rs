mod tests_insert;

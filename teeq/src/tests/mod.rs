mod concurrent_reclaim_tests;

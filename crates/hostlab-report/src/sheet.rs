use anyhow::{anyhow, Context, Result};
use hostlab_archive::read_descriptor_entry;
use hostlab_core::summary::{
    ABI_ATTR_KEY, MODULE_TAG, NAME_ATTR_KEY, RESULT_ATTR_KEY, TESTCASE_TAG, TEST_TAG,
};
use hostlab_core::DescriptorAttributes;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use xml::reader::{EventReader, XmlEvent};

pub const DEFAULT_MAX_ROWS: usize = 30000;
pub const TOO_MANY_ROWS_SENTINEL: &str = "too many to be displayed";
pub const NO_DATA: &str = "no_data";
const PASS_RESULT: &str = "pass";

const COLUMNS: &[&str] = &["RESULT", "ABI", "TEST_MODULE", "TEST_CLASS", "TEST_CASE"];
const REFERENCE_COLUMN: &str = "REFERENCE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetOptions {
    pub max_rows: usize,
    /// Descriptor (or bundle) whose results fill the reference column.
    pub reference: Option<std::path::PathBuf>,
    pub extra_rows: Vec<String>,
}

impl Default for SheetOptions {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            reference: None,
            extra_rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestKey {
    pub abi: String,
    pub module: String,
    pub class: String,
    pub case: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRow {
    pub result: String,
    pub key: TestKey,
    /// `None` outside comparison mode.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetRow {
    Test(TestRow),
    TooMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTable {
    pub extra_rows: Vec<String>,
    pub header: Vec<(&'static str, String)>,
    pub columns: Vec<&'static str>,
    pub rows: Vec<SheetRow>,
}

impl SheetTable {
    /// Extra rows are written verbatim; everything else goes through the
    /// CSV writer, one record per line with ragged widths.
    pub fn to_csv(&self) -> Result<String> {
        let mut out = String::new();
        for row in &self.extra_rows {
            out.push_str(row);
            out.push('\n');
        }
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        for (key, value) in &self.header {
            writer.write_record([*key, value.as_str()])?;
        }
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            match row {
                SheetRow::TooMany => writer.write_record([TOO_MANY_ROWS_SENTINEL])?,
                SheetRow::Test(test) => {
                    let mut cells = vec![
                        test.result.as_str(),
                        test.key.abi.as_str(),
                        test.key.module.as_str(),
                        test.key.class.as_str(),
                        test.key.case.as_str(),
                    ];
                    if let Some(reference) = &test.reference {
                        cells.push(reference);
                    }
                    writer.write_record(&cells)?;
                }
            }
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow!("failed to flush sheet: {}", e.error()))?;
        out.push_str(&String::from_utf8(bytes).context("sheet is not valid UTF-8")?);
        Ok(out)
    }

    pub fn test_rows(&self) -> impl Iterator<Item = &TestRow> {
        self.rows.iter().filter_map(|row| match row {
            SheetRow::Test(test) => Some(test),
            SheetRow::TooMany => None,
        })
    }
}

/// Descriptor bytes of `source`: the file itself, or the descriptor entry
/// when `source` is a zip bundle.
fn load_descriptor(source: &Path) -> Result<Vec<u8>> {
    let is_zip = fs::File::open(source)
        .map(|f| zip::ZipArchive::new(f).is_ok())
        .with_context(|| format!("open {}", source.display()))?;
    if is_zip {
        let (entry, bytes) = read_descriptor_entry(source)?;
        tracing::debug!(source = %source.display(), entry = %entry, "reading descriptor from bundle");
        return Ok(bytes);
    }
    fs::read(source).with_context(|| format!("read {}", source.display()))
}

/// Streams `<Test>` elements in document order with the enclosing module and
/// test case as context.
fn for_each_test<R: Read>(reader: R, mut visit: impl FnMut(&str, TestKey)) -> Result<()> {
    let mut abi = String::new();
    let mut module = String::new();
    let mut class = String::new();
    for event in EventReader::new(reader) {
        match event.context("descriptor is not well-formed XML")? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let attr = |key: &str| {
                    attributes
                        .iter()
                        .find(|a| a.name.local_name == key)
                        .map(|a| a.value.clone())
                        .unwrap_or_default()
                };
                match name.local_name.as_str() {
                    MODULE_TAG => {
                        module = attr(NAME_ATTR_KEY);
                        abi = attr(ABI_ATTR_KEY);
                    }
                    TESTCASE_TAG => class = attr(NAME_ATTR_KEY),
                    TEST_TAG => visit(
                        &attr(RESULT_ATTR_KEY),
                        TestKey {
                            abi: abi.clone(),
                            module: module.clone(),
                            class: class.clone(),
                            case: attr(NAME_ATTR_KEY),
                        },
                    ),
                    _ => {}
                }
            }
            XmlEvent::EndElement { name } => match name.local_name.as_str() {
                MODULE_TAG => {
                    module.clear();
                    abi.clear();
                }
                TESTCASE_TAG => class.clear(),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

fn load_reference(source: &Path) -> Result<HashMap<TestKey, String>> {
    let bytes = load_descriptor(source)?;
    let mut results = HashMap::new();
    for_each_test(Cursor::new(bytes), |result, key| {
        results.insert(key, result.to_string());
    })
    .with_context(|| format!("parse reference {}", source.display()))?;
    Ok(results)
}

/// Builds the table for `source`. Passing rows are dropped when the
/// descriptor reports more tests than `max_rows` (or unparseable counts);
/// past `max_rows` one sentinel row stands in for the rest.
pub fn export(source: &Path, options: &SheetOptions) -> Result<SheetTable> {
    let bytes = load_descriptor(source)?;
    let mut cursor = Cursor::new(bytes);
    let attributes = DescriptorAttributes::from_reader(&mut cursor, source)?;
    let header = attributes
        .groups()
        .iter()
        .flat_map(|group| group.values.iter().cloned())
        .collect();

    let show_pass = attributes
        .reported_test_count()
        .map(|total| total <= options.max_rows as u64)
        .unwrap_or(false);
    let reference = match &options.reference {
        Some(path) => Some(load_reference(path)?),
        None => None,
    };

    let mut rows = Vec::new();
    let mut written = 0usize;
    cursor.set_position(0);
    for_each_test(cursor, |result, key| {
        if !show_pass && result == PASS_RESULT {
            return;
        }
        if written > options.max_rows {
            return;
        }
        written += 1;
        if written > options.max_rows {
            rows.push(SheetRow::TooMany);
            return;
        }
        let reference_cell = reference.as_ref().map(|known| {
            if result == PASS_RESULT {
                String::new()
            } else {
                known
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| NO_DATA.to_string())
            }
        });
        rows.push(SheetRow::Test(TestRow {
            result: result.to_string(),
            key,
            reference: reference_cell,
        }));
    })
    .with_context(|| format!("parse {}", source.display()))?;

    if written > options.max_rows {
        tracing::warn!(
            source = %source.display(),
            max_rows = options.max_rows,
            "row cap reached; remaining rows suppressed"
        );
    }

    let mut columns = COLUMNS.to_vec();
    if reference.is_some() {
        columns.push(REFERENCE_COLUMN);
    }
    Ok(SheetTable {
        extra_rows: options.extra_rows.clone(),
        header,
        columns,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlab_core::ScratchDir;
    use std::io::Write;

    fn descriptor(pass: &str, failed: &str, tests: &[(&str, &str, &str)]) -> String {
        let mut body = String::new();
        body.push_str(&format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Result suite_name="VTS" suite_plan="vts" start_display="Mon Jun 11">
  <Build build_fingerprint="google/walleye" />
  <Summary pass="{}" failed="{}" modules_total="1" modules_done="1" />
  <Module name="VtsKernelLtp" abi="arm64-v8a">
"#,
            pass, failed
        ));
        let mut current_class = "";
        for (class, case, result) in tests {
            if *class != current_class {
                if !current_class.is_empty() {
                    body.push_str("    </TestCase>\n");
                }
                body.push_str(&format!("    <TestCase name=\"{}\">\n", class));
                current_class = *class;
            }
            body.push_str(&format!(
                "      <Test result=\"{}\" name=\"{}\" />\n",
                result, case
            ));
        }
        if !current_class.is_empty() {
            body.push_str("    </TestCase>\n");
        }
        body.push_str("  </Module>\n</Result>\n");
        body
    }

    #[test]
    fn rows_carry_module_and_class_context() {
        let scratch = ScratchDir::new("sheet_rows").expect("scratch");
        let path = scratch.path().join("test_result.xml");
        fs::write(
            &path,
            descriptor(
                "1",
                "1",
                &[("KernelTest", "open01", "pass"), ("KernelTest", "open02", "fail")],
            ),
        )
        .expect("descriptor");

        let table = export(&path, &SheetOptions::default()).expect("export");
        let rows: Vec<_> = table.test_rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].result, "fail");
        assert_eq!(rows[1].key.abi, "arm64-v8a");
        assert_eq!(rows[1].key.module, "VtsKernelLtp");
        assert_eq!(rows[1].key.class, "KernelTest");
        assert_eq!(rows[1].key.case, "open02");
        assert!(rows[1].reference.is_none());

        let csv = table.to_csv().expect("csv");
        assert!(csv.contains("suite_name,VTS\n"));
        assert!(csv.contains("suite_version,\n"));
        assert!(csv.contains("RESULT,ABI,TEST_MODULE,TEST_CLASS,TEST_CASE\n"));
        assert!(csv.ends_with("fail,arm64-v8a,VtsKernelLtp,KernelTest,open02\n"));
    }

    #[test]
    fn large_results_keep_only_failures_up_to_the_cap() {
        let scratch = ScratchDir::new("sheet_cap").expect("scratch");
        let path = scratch.path().join("test_result.xml");
        let tests: Vec<(&str, &str, &str)> = vec![
            ("C", "t1", "fail"),
            ("C", "t2", "pass"),
            ("C", "t3", "fail"),
            ("C", "t4", "fail"),
            ("C", "t5", "fail"),
            ("C", "t6", "fail"),
        ];
        fs::write(&path, descriptor("10", "5", &tests)).expect("descriptor");

        let options = SheetOptions {
            max_rows: 3,
            ..SheetOptions::default()
        };
        let table = export(&path, &options).expect("export");
        assert_eq!(table.rows.len(), 4);
        assert!(table.test_rows().all(|row| row.result == "fail"));
        assert_eq!(table.rows.last(), Some(&SheetRow::TooMany));
        let csv = table.to_csv().expect("csv");
        assert_eq!(csv.matches(TOO_MANY_ROWS_SENTINEL).count(), 1);
        assert!(csv.ends_with("too many to be displayed\n"));
    }

    #[test]
    fn unparseable_counts_hide_passing_rows() {
        let scratch = ScratchDir::new("sheet_counts").expect("scratch");
        let path = scratch.path().join("test_result.xml");
        fs::write(
            &path,
            descriptor("", "1", &[("C", "t1", "pass"), ("C", "t2", "fail")]),
        )
        .expect("descriptor");
        let table = export(&path, &SheetOptions::default()).expect("export");
        let results: Vec<_> = table.test_rows().map(|r| r.result.as_str()).collect();
        assert_eq!(results, vec!["fail"]);
    }

    #[test]
    fn reference_column_compares_failures_only() {
        let scratch = ScratchDir::new("sheet_ref").expect("scratch");
        let path = scratch.path().join("test_result.xml");
        fs::write(
            &path,
            descriptor(
                "1",
                "2",
                &[("C", "t1", "pass"), ("C", "t2", "fail"), ("C", "t3", "fail")],
            ),
        )
        .expect("descriptor");
        let reference = scratch.path().join("reference.xml");
        fs::write(&reference, descriptor("1", "0", &[("C", "t2", "pass")])).expect("reference");

        let options = SheetOptions {
            reference: Some(reference),
            ..SheetOptions::default()
        };
        let table = export(&path, &options).expect("export");
        let cells: Vec<_> = table
            .test_rows()
            .map(|r| r.reference.clone().unwrap_or_default())
            .collect();
        assert_eq!(cells, vec!["", "pass", NO_DATA]);
        assert_eq!(table.columns.last(), Some(&REFERENCE_COLUMN));
    }

    #[test]
    fn bundles_are_searched_for_the_descriptor_and_extra_rows_lead() {
        let scratch = ScratchDir::new("sheet_zip").expect("scratch");
        let zip_path = scratch.path().join("log-result_1.zip");
        let file = fs::File::create(&zip_path).expect("zip");
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("run/log-result.xml", zip::write::FileOptions::default())
            .expect("entry");
        zip.write_all(descriptor("0", "1", &[("C", "t1", "fail")]).as_bytes())
            .expect("write");
        zip.finish().expect("finish");

        let options = SheetOptions {
            extra_rows: vec!["branch,git_master".to_string()],
            ..SheetOptions::default()
        };
        let csv = export(&zip_path, &options)
            .expect("export")
            .to_csv()
            .expect("csv");
        assert!(csv.starts_with("branch,git_master\nsuite_name,VTS\n"));
        assert!(csv.ends_with("fail,arm64-v8a,VtsKernelLtp,C,t1\n"));

        let empty_zip = scratch.path().join("empty.zip");
        let mut zip = zip::ZipWriter::new(fs::File::create(&empty_zip).expect("zip"));
        zip.start_file("notes.txt", zip::write::FileOptions::default())
            .expect("entry");
        zip.finish().expect("finish");
        let err = export(&empty_zip, &SheetOptions::default()).expect_err("no descriptor");
        assert!(format!("{:#}", err).contains("not a result archive"), "{:#}", err);
    }

    #[test]
    fn cells_with_commas_are_quoted() {
        let table = SheetTable {
            extra_rows: Vec::new(),
            header: vec![("build_fingerprint", "google/walleye,userdebug".to_string())],
            columns: COLUMNS.to_vec(),
            rows: vec![SheetRow::Test(TestRow {
                result: "fail".to_string(),
                key: TestKey {
                    abi: "arm64-v8a".to_string(),
                    module: "VtsHal".to_string(),
                    class: "Base".to_string(),
                    case: "say \"hi\"".to_string(),
                },
                reference: None,
            })],
        };
        let csv = table.to_csv().expect("csv");
        assert!(csv.starts_with("build_fingerprint,\"google/walleye,userdebug\"\n"));
        assert!(csv.ends_with("fail,arm64-v8a,VtsHal,Base,\"say \"\"hi\"\"\"\n"));
    }
}
